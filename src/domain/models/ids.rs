//! Opaque identifiers.
//!
//! All three are UUID newtypes. `ServerId` doubles as the certificate
//! common name on the control channel, so its `Display` output is the
//! authoritative wire form.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

id_type!(
    /// Identifier of an application.
    AppId
);
id_type!(
    /// Identifier of a single deployment attempt.
    DeploymentId
);
id_type!(
    /// Identifier of a managed server; also the agent certificate CN.
    ServerId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_id_round_trips_through_display() {
        let id = ServerId::new();
        let parsed: ServerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
