//! Per-player preferences

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PartyError;

/// A boolean preference a player can toggle
///
/// Every setting is enabled until the player turns it off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerSetting {
    /// Party notices such as joins, leaves and chat
    Notifications,
}

impl PlayerSetting {
    pub const ALL: [PlayerSetting; 1] = [PlayerSetting::Notifications];

    /// Lowercase name, also the SQL column
    pub fn name(&self) -> &'static str {
        match self {
            PlayerSetting::Notifications => "notifications",
        }
    }
}

impl fmt::Display for PlayerSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PlayerSetting {
    type Err = PartyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PlayerSetting::ALL
            .into_iter()
            .find(|setting| setting.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PartyError::UnknownSetting(s.to_string()))
    }
}
