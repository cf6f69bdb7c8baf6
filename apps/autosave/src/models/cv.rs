use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::sections::{new_item_id, SectionItem};

// Repeatable sections, persisted as whole arrays.
pub const SECTION_EXPERIENCE: &str = "experience";
pub const SECTION_EDUCATION: &str = "education";
pub const SECTION_SKILLS: &str = "skills";
pub const SECTION_PROJECTS: &str = "projects";

// Single form fields of the personal-details step.
pub const FIELD_FULL_NAME: &str = "full_name";
pub const FIELD_HEADLINE: &str = "headline";
pub const FIELD_EMAIL: &str = "email";
pub const FIELD_PHONE: &str = "phone";
pub const FIELD_LOCATION: &str = "location";
pub const FIELD_SUMMARY: &str = "summary";

/// The document as returned by the store: section/field name → JSON value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CvSnapshot {
    pub id: Uuid,
    #[serde(default)]
    pub sections: BTreeMap<String, Value>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CvSnapshot {
    pub fn empty(id: Uuid) -> Self {
        Self {
            id,
            sections: BTreeMap::new(),
            updated_at: None,
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.sections.get(key)
    }

    /// Decodes a repeatable section. Missing or `null` sections are empty.
    pub fn section<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, serde_json::Error> {
        match self.sections.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExperienceItem {
    pub id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    /// `YYYY-MM` or `YYYY-MM-DD`, empty while the user has not filled it in.
    pub start_date: String,
    pub end_date: String,
    /// Still working here; no end date expected.
    pub current: bool,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EducationItem {
    pub id: String,
    pub school: String,
    pub degree: String,
    pub field_of_study: String,
    pub start_date: String,
    pub end_date: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SkillItem {
    pub id: String,
    pub name: String,
    /// 1 (beginner) to 5 (expert).
    pub level: Option<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectItem {
    pub id: String,
    pub name: String,
    pub url: String,
    pub start_date: String,
    pub end_date: String,
    pub description: String,
}

macro_rules! section_item {
    ($ty:ty) => {
        impl SectionItem for $ty {
            fn id(&self) -> &str {
                &self.id
            }
        }

        impl $ty {
            /// A blank item with a fresh id, as created by the "add" button.
            pub fn blank() -> Self {
                Self {
                    id: new_item_id(),
                    ..Default::default()
                }
            }
        }
    };
}

section_item!(ExperienceItem);
section_item!(EducationItem);
section_item!(SkillItem);
section_item!(ProjectItem);
