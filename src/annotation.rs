//! Field layout annotations exported from Label Studio.
//!
//! Each page task carries a flat list of result items. A question field is
//! described by three items sharing an `id`: the rectangle itself
//! (`from_name == "box"`), the question number (`"nomor"`) and the 1-based
//! page number (`"halaman"`). Items are grouped by id before any of them is
//! interpreted.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;

use crate::{Error, Result};

const BOX_TYPE: &str = "rectanglelabels";
const BOX_NAME: &str = "box";
const QUESTION_NAME: &str = "nomor";
const PAGE_NAME: &str = "halaman";

/// Question id used when a box has no question number label.
pub const UNKNOWN_QUESTION: &str = "N/A";

/// Questionnaire variant; each has its own field layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "pria",
            Gender::Female => "perempuan",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gender {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pria" => Ok(Gender::Male),
            "perempuan" => Ok(Gender::Female),
            other => Err(Error::UnknownGender(other.to_string())),
        }
    }
}

/// Conventional location of the annotation file for `gender`.
pub fn annotation_path(data_dir: &Path, gender: Gender) -> PathBuf {
    data_dir.join(format!("anotasi_{gender}.json"))
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationTask {
    #[serde(default)]
    pub data: TaskData,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskData {
    /// Page image the layout was drawn on.
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub result: Vec<ResultItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultItem {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub from_name: String,
    #[serde(default)]
    pub value: ItemValue,
    pub original_width: Option<f32>,
    pub original_height: Option<f32>,
}

impl ResultItem {
    fn is_box(&self) -> bool {
        self.kind == BOX_TYPE && self.from_name == BOX_NAME
    }

    fn first_text(&self) -> Option<&str> {
        self.value.text.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemValue {
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub width: Option<f32>,
    pub height: Option<f32>,
    #[serde(default)]
    pub text: Vec<String>,
}

/// Rectangle in percent (0 to 100) of the annotation-time image size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldAnnotation {
    pub question_id: String,
    /// 1-based page number, 0 when the page label is missing or unreadable.
    pub page: u32,
    pub rect: NormalizedRect,
    pub original_width: f32,
    pub original_height: f32,
}

impl FieldAnnotation {
    /// Zero-based page index if the page exists in a document of
    /// `page_count` pages.
    pub fn page_index(&self, page_count: usize) -> Option<usize> {
        let index = (self.page as usize).checked_sub(1)?;
        (index < page_count).then_some(index)
    }
}

#[derive(Default)]
struct Group<'a> {
    boxes: Vec<(usize, &'a ResultItem)>,
    questions: Vec<&'a ResultItem>,
    pages: Vec<&'a ResultItem>,
}

impl AnnotationTask {
    fn items(&self) -> &[ResultItem] {
        self.annotations
            .first()
            .map(|annotation| annotation.result.as_slice())
            .unwrap_or_default()
    }

    /// Joins the result items of this task into question fields, in the order
    /// their rectangles appear. Groups without exactly one usable rectangle
    /// are skipped.
    pub fn fields(&self) -> Vec<FieldAnnotation> {
        let mut index = HashMap::<&str, usize>::new();
        let mut groups = Vec::<Group>::new();

        for (position, item) in self.items().iter().enumerate() {
            let slot = *index.entry(item.id.as_str()).or_insert_with(|| {
                groups.push(Group::default());
                groups.len() - 1
            });
            let group = &mut groups[slot];
            if item.is_box() {
                group.boxes.push((position, item));
            } else if item.from_name == QUESTION_NAME {
                group.questions.push(item);
            } else if item.from_name == PAGE_NAME {
                group.pages.push(item);
            }
        }

        let mut fields = groups
            .into_iter()
            .filter_map(|group| {
                let &[(position, rect_item)] = group.boxes.as_slice() else {
                    if group.boxes.len() > 1 {
                        log::warn!("Skipping annotation with {} rectangles", group.boxes.len());
                    }
                    return None;
                };
                let field = to_field(rect_item, &group)?;
                Some((position, field))
            })
            .collect::<Vec<_>>();
        fields.sort_by_key(|(position, _)| *position);
        fields.into_iter().map(|(_, field)| field).collect()
    }
}

fn to_field(item: &ResultItem, group: &Group) -> Option<FieldAnnotation> {
    let value = &item.value;
    let (Some(x), Some(y), Some(width), Some(height)) = (value.x, value.y, value.width, value.height)
    else {
        log::warn!("Skipping rectangle {} without geometry", item.id);
        return None;
    };
    let (Some(original_width), Some(original_height)) = (item.original_width, item.original_height)
    else {
        log::warn!("Skipping rectangle {} without original image size", item.id);
        return None;
    };
    if original_width <= 0.0 || original_height <= 0.0 {
        log::warn!("Skipping rectangle {} with empty original image size", item.id);
        return None;
    }

    let question_id = group
        .questions
        .first()
        .and_then(|label| label.first_text())
        .unwrap_or(UNKNOWN_QUESTION)
        .to_string();
    let page = group
        .pages
        .first()
        .and_then(|label| label.first_text())
        .and_then(|text| text.trim().parse::<u32>().ok())
        .unwrap_or(0);

    Some(FieldAnnotation {
        question_id,
        page,
        rect: NormalizedRect {
            x,
            y,
            width,
            height,
        },
        original_width,
        original_height,
    })
}

pub fn parse_tasks(json: &str) -> Result<Vec<AnnotationTask>> {
    Ok(serde_json::from_str(json)?)
}

/// Loads all page tasks from an annotation file.
pub fn load_tasks(path: &Path) -> Result<Vec<AnnotationTask>> {
    if !path.exists() {
        return Err(Error::AnnotationNotFound(path.to_path_buf()));
    }
    let json = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let tasks = parse_tasks(&json)?;
    log::debug!("Loaded {} annotation tasks from {path:?}", tasks.len());
    Ok(tasks)
}
