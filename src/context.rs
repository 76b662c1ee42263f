// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::{Deserialize, Serialize};

/// The authenticated caller, passed explicitly into every user-scoped operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub id: i64,
    #[serde(default)]
    pub nick_name: String,
    #[serde(default)]
    pub icon: String,
}

impl UserIdentity {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            nick_name: String::new(),
            icon: String::new(),
        }
    }

    #[must_use]
    pub fn with_nick_name(mut self, nick_name: impl Into<String>) -> Self {
        self.nick_name = nick_name.into();
        self
    }
}
