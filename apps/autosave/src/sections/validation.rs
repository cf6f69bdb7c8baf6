use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::cv::{EducationItem, ExperienceItem, ProjectItem, SkillItem};

pub const REQUIRED: &str = "required";
pub const TOO_LONG: &str = "too long";
pub const INVALID_DATE: &str = "invalid date";
pub const END_BEFORE_START: &str = "must be after start date";
pub const OUT_OF_RANGE: &str = "out of range";
pub const INVALID_URL: &str = "invalid url";

const MAX_NAME_LEN: usize = 100;
const MAX_DESCRIPTION_LEN: usize = 2000;
const SKILL_LEVELS: std::ops::RangeInclusive<u8> = 1..=5;

/// Per-field error messages for one item. Empty means the item is valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, String>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// Records `message` for `field` unless the field already has one; the
    /// first failing rule for a field is the one shown.
    pub fn insert(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_insert_with(|| message.into());
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    fn require(&mut self, field: &str, value: &str) -> bool {
        if value.trim().is_empty() {
            self.insert(field, REQUIRED);
            false
        } else {
            true
        }
    }

    fn max_len(&mut self, field: &str, value: &str, max: usize) {
        if value.chars().count() > max {
            self.insert(field, TOO_LONG);
        }
    }
}

/// Pure, deterministic item validator.
pub trait Validator<T>: Send + Sync {
    fn validate(&self, item: &T) -> FieldErrors;
}

impl<T, F> Validator<T> for F
where
    F: Fn(&T) -> FieldErrors + Send + Sync,
{
    fn validate(&self, item: &T) -> FieldErrors {
        self(item)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Dates
// ────────────────────────────────────────────────────────────────────────────

/// Parses `YYYY-MM` (month precision, pinned to the 1st) or `YYYY-MM-DD`.
pub fn parse_cv_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d"))
        .ok()
}

/// Validates an optional date range. Empty dates are left to the caller's
/// required-field rules.
fn check_date_range(errors: &mut FieldErrors, start: &str, end: &str) {
    let start_date = match start.trim() {
        "" => None,
        raw => match parse_cv_date(raw) {
            Some(d) => Some(d),
            None => {
                errors.insert("start_date", INVALID_DATE);
                None
            }
        },
    };
    let end_date = match end.trim() {
        "" => None,
        raw => match parse_cv_date(raw) {
            Some(d) => Some(d),
            None => {
                errors.insert("end_date", INVALID_DATE);
                None
            }
        },
    };
    if let (Some(s), Some(e)) = (start_date, end_date) {
        if e < s {
            errors.insert("end_date", END_BEFORE_START);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Section validators
// ────────────────────────────────────────────────────────────────────────────

pub fn validate_experience(item: &ExperienceItem) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if errors.require("title", &item.title) {
        errors.max_len("title", &item.title, MAX_NAME_LEN);
    }
    if errors.require("company", &item.company) {
        errors.max_len("company", &item.company, MAX_NAME_LEN);
    }
    errors.require("start_date", &item.start_date);
    if item.current {
        // An ongoing role ignores any stale end date.
        check_date_range(&mut errors, &item.start_date, "");
    } else {
        errors.require("end_date", &item.end_date);
        check_date_range(&mut errors, &item.start_date, &item.end_date);
    }
    errors.max_len("description", &item.description, MAX_DESCRIPTION_LEN);
    errors
}

pub fn validate_education(item: &EducationItem) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if errors.require("school", &item.school) {
        errors.max_len("school", &item.school, MAX_NAME_LEN);
    }
    if errors.require("degree", &item.degree) {
        errors.max_len("degree", &item.degree, MAX_NAME_LEN);
    }
    errors.max_len("field_of_study", &item.field_of_study, MAX_NAME_LEN);
    errors.require("start_date", &item.start_date);
    check_date_range(&mut errors, &item.start_date, &item.end_date);
    errors.max_len("description", &item.description, MAX_DESCRIPTION_LEN);
    errors
}

pub fn validate_skill(item: &SkillItem) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if errors.require("name", &item.name) {
        errors.max_len("name", &item.name, MAX_NAME_LEN);
    }
    if let Some(level) = item.level {
        if !SKILL_LEVELS.contains(&level) {
            errors.insert("level", OUT_OF_RANGE);
        }
    }
    errors
}

pub fn validate_project(item: &ProjectItem) -> FieldErrors {
    let mut errors = FieldErrors::new();
    if errors.require("name", &item.name) {
        errors.max_len("name", &item.name, MAX_NAME_LEN);
    }
    let url = item.url.trim();
    if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
        errors.insert("url", INVALID_URL);
    }
    check_date_range(&mut errors, &item.start_date, &item.end_date);
    errors.max_len("description", &item.description, MAX_DESCRIPTION_LEN);
    errors
}
