use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Operator account that owns campaigns, queue entries and opt-outs.
    OwnerId
);
string_id!(CampaignId);
string_id!(
    /// Persisted queue entry (one scheduled execution of a campaign).
    QueueEntryId
);
string_id!(
    /// Local message record id. Not the carrier's message id.
    MessageRecordId
);
string_id!(
    /// Opaque handle of one execution on the task runtime.
    TaskId
);
string_id!(
    /// E.164-ish phone number as the carrier reports it (digits, optional `+`).
    PhoneNumber
);

/// Fresh random id for records created by this process.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Operator account as far as dispatch is concerned: sub-accounts inherit the
/// opt-out list of the admin that created them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: OwnerId,
    pub parent: Option<OwnerId>,
}

/// Contact row from the contact store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub owner: OwnerId,
    pub phone_number: PhoneNumber,
    pub name: String,
    pub groups: Vec<String>,
}

/// One eligible recipient of a campaign run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub phone_number: PhoneNumber,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptOutScope {
    Platform,
    Owner,
}

/// Do-not-contact entry. `(phone_number, owner)` is unique.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptOutEntry {
    pub phone_number: PhoneNumber,
    pub reason: String,
    pub scope: OptOutScope,
    pub owner: OwnerId,
    pub added_at: chrono::DateTime<chrono::Utc>,
}
