//! Birthday message construction.

use crate::storage::Person;

/// A message ready for the delivery client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BirthdayMessage {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl BirthdayMessage {
    pub fn for_person(person: &Person, subject: &str) -> Self {
        Self {
            recipient: person.email.clone(),
            subject: subject.to_string(),
            body: format!("Happy Birthday, {}!", person.first_name.trim()),
        }
    }
}
