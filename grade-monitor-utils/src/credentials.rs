use derive_more::{AsRef, Display, From};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

#[derive(Clone, PartialEq, Eq, Debug, TypedBuilder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub student_id: StudentId,
    pub password: Password,
}

#[derive(Clone, PartialEq, Eq, Debug, From, AsRef, Display, Serialize, Deserialize)]
#[as_ref(forward)]
pub struct StudentId(String);

/// Portal password; `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq, From, AsRef, Serialize, Deserialize)]
#[as_ref(forward)]
pub struct Password(String);
impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(***)")
    }
}

impl Password {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl StudentId {
    /// The portal signs in with `<student id>@<domain>`.
    pub fn email(&self, domain: &str) -> String {
        format!("{}@{domain}", self.0)
    }
}
