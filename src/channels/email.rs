use serde::{Deserialize, Serialize};

use super::{is_valid_email, DispatchPayload};
use crate::error::{DispatchError, DispatchResult};

const MAX_NAME_LENGTH: usize = 250;
const MAX_SUBJECT_LENGTH: usize = 500;

/// Outbound email content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub to_email: String,
    pub to_name: Option<String>,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub cc_email: Option<String>,
    pub cc_name: Option<String>,
    pub bcc_email: Option<String>,
    pub bcc_name: Option<String>,
    pub subject: String,
    pub body_html: String,
}

impl EmailPayload {
    pub fn new(
        to_email: impl Into<String>,
        subject: impl Into<String>,
        body_html: impl Into<String>,
    ) -> Self {
        Self {
            to_email: to_email.into(),
            to_name: None,
            from_email: None,
            from_name: None,
            cc_email: None,
            cc_name: None,
            bcc_email: None,
            bcc_name: None,
            subject: subject.into(),
            body_html: body_html.into(),
        }
    }

    pub fn with_to_name(mut self, name: impl Into<String>) -> Self {
        self.to_name = Some(name.into());
        self
    }

    pub fn with_from(mut self, email: impl Into<String>, name: Option<String>) -> Self {
        self.from_email = Some(email.into());
        self.from_name = name;
        self
    }

    pub fn with_cc(mut self, email: impl Into<String>) -> Self {
        self.cc_email = Some(email.into());
        self
    }

    pub fn with_bcc(mut self, email: impl Into<String>) -> Self {
        self.bcc_email = Some(email.into());
        self
    }
}

impl DispatchPayload for EmailPayload {
    const CHANNEL: &'static str = "email";

    fn validate(&self) -> DispatchResult<()> {
        if self.to_email.trim().is_empty() {
            return Err(DispatchError::validation("to_email is required"));
        }
        if !is_valid_email(&self.to_email) {
            return Err(DispatchError::validation(format!(
                "to_email is not a valid address: {}",
                self.to_email
            )));
        }

        let optional_addresses = [
            ("from_email", &self.from_email),
            ("cc_email", &self.cc_email),
            ("bcc_email", &self.bcc_email),
        ];
        for (field, value) in optional_addresses {
            if let Some(address) = value {
                if !is_valid_email(address) {
                    return Err(DispatchError::validation(format!(
                        "{field} is not a valid address: {address}"
                    )));
                }
            }
        }

        let names = [
            ("to_name", &self.to_name),
            ("from_name", &self.from_name),
            ("cc_name", &self.cc_name),
            ("bcc_name", &self.bcc_name),
        ];
        for (field, value) in names {
            if value
                .as_ref()
                .is_some_and(|name| name.chars().count() > MAX_NAME_LENGTH)
            {
                return Err(DispatchError::validation(format!(
                    "{field} exceeds {MAX_NAME_LENGTH} characters"
                )));
            }
        }

        if self.subject.trim().is_empty() {
            return Err(DispatchError::validation("subject is required"));
        }
        if self.subject.chars().count() > MAX_SUBJECT_LENGTH {
            return Err(DispatchError::validation(format!(
                "subject exceeds {MAX_SUBJECT_LENGTH} characters"
            )));
        }
        if self.body_html.trim().is_empty() {
            return Err(DispatchError::validation("body_html is required"));
        }

        Ok(())
    }
}
