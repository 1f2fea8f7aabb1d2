//! Structured results for client-facing calls.
//!
//! A [`ReturnVal`] always says whether the call succeeded. Failures carry a
//! dialog (title and text) ready to show to a user, and any result may carry
//! rescan hints naming objects and fields an interactive client should
//! refresh.

use crate::core::{DbError, ErrorKind, FieldId, Invid, Result};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dialog {
    pub title: String,
    pub text: String,
}

impl Dialog {
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
        }
    }
}

/// Ask the client to refresh `fields` of `invid` (every field if empty).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RescanHint {
    pub invid: Invid,
    pub fields: Vec<FieldId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReturnVal<T = ()> {
    success: bool,
    value: Option<T>,
    dialog: Option<Dialog>,
    error_kind: Option<ErrorKind>,
    rescan: Vec<RescanHint>,
    #[serde(skip)]
    error: Option<DbError>,
}

impl<T> ReturnVal<T> {
    pub fn success(value: T) -> Self {
        Self {
            success: true,
            value: Some(value),
            dialog: None,
            error_kind: None,
            rescan: Vec::new(),
            error: None,
        }
    }

    /// Failure reported as a dialog built from `err`.
    pub fn failure(err: DbError) -> Self {
        Self {
            success: false,
            value: None,
            dialog: Some(Dialog::new(err.title(), err.to_string())),
            error_kind: Some(err.kind()),
            rescan: Vec::new(),
            error: Some(err),
        }
    }

    /// Attach an informational dialog to a successful result.
    pub fn with_dialog(mut self, dialog: Dialog) -> Self {
        self.dialog = Some(dialog);
        self
    }

    pub fn with_rescan(mut self, invid: Invid, fields: Vec<FieldId>) -> Self {
        self.add_rescan(invid, fields);
        self
    }

    fn add_rescan(&mut self, invid: Invid, fields: Vec<FieldId>) {
        match self.rescan.iter_mut().find(|h| h.invid == invid) {
            // an empty field list already means the whole object
            Some(hint) if hint.fields.is_empty() => {}
            Some(hint) if fields.is_empty() => hint.fields.clear(),
            Some(hint) => {
                for field in fields {
                    if !hint.fields.contains(&field) {
                        hint.fields.push(field);
                    }
                }
            }
            None => self.rescan.push(RescanHint { invid, fields }),
        }
    }

    /// Fold another result's rescan hints into this one.
    pub fn union_rescan<U>(&mut self, other: &ReturnVal<U>) {
        for hint in &other.rescan {
            self.add_rescan(hint.invid, hint.fields.clone());
        }
    }

    pub fn did_succeed(&self) -> bool {
        self.success
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn dialog(&self) -> Option<&Dialog> {
        self.dialog.as_ref()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    pub fn error(&self) -> Option<&DbError> {
        self.error.as_ref()
    }

    pub fn rescan(&self) -> &[RescanHint] {
        &self.rescan
    }

    pub fn into_result(self) -> Result<T> {
        match (self.value, self.error) {
            (_, Some(err)) => Err(err),
            (Some(value), None) => Ok(value),
            (None, None) => Err(DbError::Fatal("result carries no value".to_string())),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ReturnVal<U> {
        ReturnVal {
            success: self.success,
            value: self.value.map(f),
            dialog: self.dialog,
            error_kind: self.error_kind,
            rescan: self.rescan,
            error: self.error,
        }
    }
}

impl ReturnVal<()> {
    pub fn ok() -> Self {
        Self::success(())
    }
}

impl<T> From<Result<T>> for ReturnVal<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::success(value),
            Err(err) => Self::failure(err),
        }
    }
}
