//! Key codec for the single-table layout
//!
//! Users, channels and subscriptions share one table. Every item is addressed by a
//! (`PK`, `SK`) pair whose prefixes tell the entity kind apart:
//!
//! | Entity       | `PK`                 | `SK`              |
//! |--------------|----------------------|-------------------|
//! | User         | `user#<id>`          | `user#<id>`       |
//! | Channel      | `channel#<id>`       | `channel#<id>`    |
//! | Subscription | `channel#<channel>`  | `user#<user>`     |
//!
//! Callers never build raw keys; they go through the functions in this module.

use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;
use strum::Display;
use thiserror::Error;

/// Prefix of user key parts
pub const USER_PREFIX: &str = "user#";
/// Prefix of channel key parts
pub const CHANNEL_PREFIX: &str = "channel#";

/// Key attribute names shared by the subscription and search result tables
#[derive(Debug, Clone, Copy, Display)]
pub enum KeyAttribute {
    /// Partition key
    #[strum(serialize = "PK")]
    Pk,
    /// Sort key
    #[strum(serialize = "SK")]
    Sk,
}

/// Result type for key decoding
pub type KeyResult<T> = Result<T, KeyError>;

/// Raised when a stored key does not follow the prefix convention.
///
/// This is never caused by user input; it means a programming error or corrupted data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Key does not carry the expected prefix or a numeric id
    #[error("Malformed key `{key}`: expected `{expected}<id>`")]
    MalformedKey {
        /// The offending key part
        key: String,
        /// Prefix that was expected
        expected: &'static str,
    },
}

/// A (partition key, sort key) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    /// Partition key value
    pub pk: String,
    /// Sort key value
    pub sk: String,
}

impl ItemKey {
    /// Converts the key into the attribute map expected by the store
    #[must_use]
    pub fn to_attributes(&self) -> HashMap<String, AttributeValue> {
        HashMap::from([
            (
                KeyAttribute::Pk.to_string(),
                AttributeValue::S(self.pk.clone()),
            ),
            (
                KeyAttribute::Sk.to_string(),
                AttributeValue::S(self.sk.clone()),
            ),
        ])
    }

    /// Reads the key pair out of a stored item
    ///
    /// # Errors
    ///
    /// Returns `KeyError::MalformedKey` if either key attribute is missing or not a string
    pub fn from_attributes(item: &HashMap<String, AttributeValue>) -> KeyResult<Self> {
        let read = |attribute: KeyAttribute| {
            item.get(&attribute.to_string())
                .and_then(|value| value.as_s().ok())
                .cloned()
                .ok_or_else(|| KeyError::MalformedKey {
                    key: format!("<missing {attribute}>"),
                    expected: "",
                })
        };

        Ok(Self {
            pk: read(KeyAttribute::Pk)?,
            sk: read(KeyAttribute::Sk)?,
        })
    }
}

/// Formats the key part of a user
#[must_use]
pub fn user_part(user_id: i64) -> String {
    format!("{USER_PREFIX}{user_id}")
}

/// Formats the key part of a channel
#[must_use]
pub fn channel_part(channel_id: i64) -> String {
    format!("{CHANNEL_PREFIX}{channel_id}")
}

/// Key of a user record
#[must_use]
pub fn user_key(user_id: i64) -> ItemKey {
    ItemKey {
        pk: user_part(user_id),
        sk: user_part(user_id),
    }
}

/// Key of a channel record
#[must_use]
pub fn channel_key(channel_id: i64) -> ItemKey {
    ItemKey {
        pk: channel_part(channel_id),
        sk: channel_part(channel_id),
    }
}

/// Key of the subscription of `user_id` to `channel_id`
#[must_use]
pub fn subscription_key(channel_id: i64, user_id: i64) -> ItemKey {
    ItemKey {
        pk: channel_part(channel_id),
        sk: user_part(user_id),
    }
}

/// Parses a channel id out of a `channel#<id>` key part
///
/// # Errors
///
/// Returns `KeyError::MalformedKey` if the prefix does not match or the id is not numeric
pub fn parse_channel_id(key: &str) -> KeyResult<i64> {
    parse_id(key, CHANNEL_PREFIX)
}

/// Parses a user id out of a `user#<id>` key part
///
/// # Errors
///
/// Returns `KeyError::MalformedKey` if the prefix does not match or the id is not numeric
pub fn parse_user_id(key: &str) -> KeyResult<i64> {
    parse_id(key, USER_PREFIX)
}

fn parse_id(key: &str, prefix: &'static str) -> KeyResult<i64> {
    key.strip_prefix(prefix)
        .and_then(|id| id.parse::<i64>().ok())
        .ok_or_else(|| KeyError::MalformedKey {
            key: key.to_string(),
            expected: prefix,
        })
}

/// The entity an item key addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    /// Self-referential user record
    User {
        /// User id
        user_id: i64,
    },
    /// Self-referential channel record
    Channel {
        /// Channel id
        channel_id: i64,
    },
    /// Relationship between a channel and a subscribed user
    Subscription {
        /// Channel id
        channel_id: i64,
        /// User id
        user_id: i64,
    },
}

impl Entity {
    /// Decodes the entity kind from a key pair
    ///
    /// # Errors
    ///
    /// Returns `KeyError::MalformedKey` for unknown prefixes, mismatched self-referential
    /// ids or a user-partitioned relationship
    pub fn classify(key: &ItemKey) -> KeyResult<Self> {
        if key.pk.starts_with(USER_PREFIX) {
            let user_id = parse_user_id(&key.pk)?;
            if parse_user_id(&key.sk)? != user_id {
                return Err(KeyError::MalformedKey {
                    key: key.sk.clone(),
                    expected: USER_PREFIX,
                });
            }
            return Ok(Self::User { user_id });
        }

        let channel_id = parse_channel_id(&key.pk)?;
        if key.sk.starts_with(USER_PREFIX) {
            return Ok(Self::Subscription {
                channel_id,
                user_id: parse_user_id(&key.sk)?,
            });
        }

        if parse_channel_id(&key.sk)? != channel_id {
            return Err(KeyError::MalformedKey {
                key: key.sk.clone(),
                expected: CHANNEL_PREFIX,
            });
        }
        Ok(Self::Channel { channel_id })
    }

    /// Key of this entity
    #[must_use]
    pub fn key(&self) -> ItemKey {
        match *self {
            Self::User { user_id } => user_key(user_id),
            Self::Channel { channel_id } => channel_key(channel_id),
            Self::Subscription {
                channel_id,
                user_id,
            } => subscription_key(channel_id, user_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(user_key(7).pk, "user#7");
        assert_eq!(user_key(7).sk, "user#7");
        assert_eq!(channel_key(-100).pk, "channel#-100");
        let key = subscription_key(3, 9);
        assert_eq!(key.pk, "channel#3");
        assert_eq!(key.sk, "user#9");
    }

    #[test]
    fn test_parse_ids() {
        assert_eq!(parse_channel_id("channel#42"), Ok(42));
        assert_eq!(parse_user_id("user#-5"), Ok(-5));
    }

    #[test]
    fn test_parse_rejects_wrong_prefix() {
        assert_eq!(
            parse_channel_id("user#42"),
            Err(KeyError::MalformedKey {
                key: "user#42".to_string(),
                expected: CHANNEL_PREFIX,
            })
        );
        assert!(parse_user_id("user#abc").is_err());
        assert!(parse_user_id("user#").is_err());
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            Entity::classify(&user_key(1)),
            Ok(Entity::User { user_id: 1 })
        );
        assert_eq!(
            Entity::classify(&channel_key(2)),
            Ok(Entity::Channel { channel_id: 2 })
        );
        assert_eq!(
            Entity::classify(&subscription_key(2, 1)),
            Ok(Entity::Subscription {
                channel_id: 2,
                user_id: 1
            })
        );

        let inverted = ItemKey {
            pk: user_part(1),
            sk: channel_part(2),
        };
        assert!(Entity::classify(&inverted).is_err());

        let mismatched = ItemKey {
            pk: channel_part(1),
            sk: channel_part(2),
        };
        assert!(Entity::classify(&mismatched).is_err());
    }

    #[test]
    fn test_attributes_roundtrip_key() {
        let key = subscription_key(10, 20);
        let attributes = key.to_attributes();
        assert_eq!(ItemKey::from_attributes(&attributes), Ok(key.clone()));
        assert_eq!(Entity::classify(&key).map(|e| e.key()), Ok(key));
    }
}
