//! Command envelope and response encoding.
//!
//! On the wire a command is a flat JSON object of string fields with a
//! `function` discriminator; list fields are `;`-joined. The envelope is
//! decoded exactly once into [`Command`], and every state machine matches on
//! that closed enum. Replies are a single [`Response`] record whose
//! `errMessage` is empty on success.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shardlock_rsm::rsm::{GroupId, ServerAddr};

use crate::error::LockError;

/// Raw string-keyed wire form.
pub type Envelope = BTreeMap<String, String>;

/// List delimiter for array fields.
pub const LIST_DELIMITER: char = ';';

/// Sequencer value carried by a failed acquire.
pub const INVALID_SEQUENCER: i64 = -1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    AcquireLock {
        lock: String,
        client: ServerAddr,
    },
    ReleaseLock {
        lock: String,
        client: ServerAddr,
    },
    ValidateLock {
        lock: String,
        sequencer: u64,
    },
    CreateLock {
        lock: String,
    },
    DeleteLock {
        lock: String,
    },
    CreateDomain {
        domain: String,
    },
    LocateLock {
        lock: String,
    },
    /// Take ownership of `locks`. `sequencers` is empty or parallel to `locks`
    /// and seeds the sequencer so it keeps counting up after a migration.
    ClaimLocks {
        locks: Vec<String>,
        sequencers: Vec<u64>,
    },
    DisownLocks {
        locks: Vec<String>,
    },
    TransferRequest {
        locks: Vec<String>,
    },
    ReleaseForClient {
        client: ServerAddr,
    },
    /// Shard to master: a recalcitrant lock was released and is now disabled.
    ReleasedRecalcitrant {
        lock: String,
        sequencer: u64,
        group: GroupId,
    },
    /// Shard to master: per-lock operation counts for the last window.
    FrequencyUpdate {
        group: GroupId,
        locks: Vec<String>,
        counts: Vec<u64>,
    },
    /// Shard to master: outcome of a `TransferRequest`.
    TransferReport {
        group: GroupId,
        ready: Vec<String>,
        sequencers: Vec<u64>,
        deferred: Vec<String>,
        missing: Vec<String>,
    },
    /// Operator request to move `locks` to shard `target`.
    MigrateLocks {
        locks: Vec<String>,
        target: GroupId,
    },
    GroupLoads,
}

impl Command {
    pub fn function(&self) -> &'static str {
        match self {
            Command::AcquireLock { .. } => "AcquireLock",
            Command::ReleaseLock { .. } => "ReleaseLock",
            Command::ValidateLock { .. } => "ValidateLock",
            Command::CreateLock { .. } => "CreateLock",
            Command::DeleteLock { .. } => "DeleteLock",
            Command::CreateDomain { .. } => "CreateDomain",
            Command::LocateLock { .. } => "LocateLock",
            Command::ClaimLocks { .. } => "ClaimLocks",
            Command::DisownLocks { .. } => "DisownLocks",
            Command::TransferRequest { .. } => "TransferRequest",
            Command::ReleaseForClient { .. } => "ReleaseForClient",
            Command::ReleasedRecalcitrant { .. } => "ReleasedRecalcitrant",
            Command::FrequencyUpdate { .. } => "FrequencyUpdate",
            Command::TransferReport { .. } => "TransferReport",
            Command::MigrateLocks { .. } => "MigrateLocks",
            Command::GroupLoads => "GroupLoads",
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let mut env = Envelope::new();
        env.insert("function".to_string(), self.function().to_string());
        let mut put = |key: &str, value: String| {
            env.insert(key.to_string(), value);
        };
        match self {
            Command::AcquireLock { lock, client } | Command::ReleaseLock { lock, client } => {
                put("lock", lock.clone());
                put("clientAddr", client.to_string());
            }
            Command::ValidateLock { lock, sequencer } => {
                put("lock", lock.clone());
                put("sequencer", sequencer.to_string());
            }
            Command::CreateLock { lock }
            | Command::DeleteLock { lock }
            | Command::LocateLock { lock } => put("lock", lock.clone()),
            Command::CreateDomain { domain } => put("domain", domain.clone()),
            Command::ClaimLocks { locks, sequencers } => {
                put("lockArray", join(locks));
                put("sequencerArray", join(sequencers));
            }
            Command::DisownLocks { locks } | Command::TransferRequest { locks } => {
                put("lockArray", join(locks))
            }
            Command::ReleaseForClient { client } => put("clientAddr", client.to_string()),
            Command::ReleasedRecalcitrant {
                lock,
                sequencer,
                group,
            } => {
                put("lock", lock.clone());
                put("sequencer", sequencer.to_string());
                put("group", group.to_string());
            }
            Command::FrequencyUpdate {
                group,
                locks,
                counts,
            } => {
                put("group", group.to_string());
                put("lockArray", join(locks));
                put("countArray", join(counts));
            }
            Command::TransferReport {
                group,
                ready,
                sequencers,
                deferred,
                missing,
            } => {
                put("group", group.to_string());
                put("lockArray", join(ready));
                put("sequencerArray", join(sequencers));
                put("deferredArray", join(deferred));
                put("missingArray", join(missing));
            }
            Command::MigrateLocks { locks, target } => {
                put("lockArray", join(locks));
                put("target", target.to_string());
            }
            Command::GroupLoads => {}
        }
        env
    }

    pub fn from_envelope(env: &Envelope) -> Result<Self, LockError> {
        let function = field(env, "function")?;
        let cmd = match function {
            "AcquireLock" => Command::AcquireLock {
                lock: lock_field(env)?,
                client: client_field(env)?,
            },
            "ReleaseLock" => Command::ReleaseLock {
                lock: lock_field(env)?,
                client: client_field(env)?,
            },
            "ValidateLock" => Command::ValidateLock {
                lock: lock_field(env)?,
                sequencer: number(env, "sequencer")?,
            },
            "CreateLock" => Command::CreateLock {
                lock: lock_field(env)?,
            },
            "DeleteLock" => Command::DeleteLock {
                lock: lock_field(env)?,
            },
            "CreateDomain" => Command::CreateDomain {
                domain: field(env, "domain")?.to_string(),
            },
            "LocateLock" => Command::LocateLock {
                lock: lock_field(env)?,
            },
            "ClaimLocks" => {
                let locks = lock_list(env, "lockArray")?;
                let sequencers = number_list(env, "sequencerArray")?;
                if !sequencers.is_empty() && sequencers.len() != locks.len() {
                    return Err(invalid("sequencerArray length does not match lockArray"));
                }
                Command::ClaimLocks { locks, sequencers }
            }
            "DisownLocks" => Command::DisownLocks {
                locks: lock_list(env, "lockArray")?,
            },
            "TransferRequest" => Command::TransferRequest {
                locks: lock_list(env, "lockArray")?,
            },
            "ReleaseForClient" => Command::ReleaseForClient {
                client: client_field(env)?,
            },
            "ReleasedRecalcitrant" => Command::ReleasedRecalcitrant {
                lock: lock_field(env)?,
                sequencer: number(env, "sequencer")?,
                group: number(env, "group")?,
            },
            "FrequencyUpdate" => {
                let locks = lock_list(env, "lockArray")?;
                let counts = number_list(env, "countArray")?;
                if counts.len() != locks.len() {
                    return Err(invalid("countArray length does not match lockArray"));
                }
                Command::FrequencyUpdate {
                    group: number(env, "group")?,
                    locks,
                    counts,
                }
            }
            "TransferReport" => {
                let ready = lock_list(env, "lockArray")?;
                let sequencers = number_list(env, "sequencerArray")?;
                if sequencers.len() != ready.len() {
                    return Err(invalid("sequencerArray length does not match lockArray"));
                }
                Command::TransferReport {
                    group: number(env, "group")?,
                    ready,
                    sequencers,
                    deferred: lock_list(env, "deferredArray")?,
                    missing: lock_list(env, "missingArray")?,
                }
            }
            "MigrateLocks" => Command::MigrateLocks {
                locks: lock_list(env, "lockArray")?,
                target: number(env, "target")?,
            },
            "GroupLoads" => Command::GroupLoads,
            other => return Err(invalid(format!("unknown function {other:?}"))),
        };
        Ok(cmd)
    }
}

pub fn encode_command(cmd: &Command) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(&cmd.to_envelope())?)
}

pub fn decode_command(data: &[u8]) -> Result<Command, LockError> {
    let env: Envelope = serde_json::from_slice(data)
        .map_err(|err| invalid(format!("malformed envelope: {err}")))?;
    Command::from_envelope(&env)
}

/// Lock names are non-empty and cannot contain the list delimiter.
pub fn validate_lock_name(lock: &str) -> Result<(), LockError> {
    if lock.is_empty() {
        return Err(invalid("empty lock name"));
    }
    if lock.contains(LIST_DELIMITER) {
        return Err(invalid(format!("lock name {lock:?} contains '{LIST_DELIMITER}'")));
    }
    Ok(())
}

fn invalid(detail: impl Into<String>) -> LockError {
    LockError::InvalidRequest(detail.into())
}

fn field<'a>(env: &'a Envelope, key: &str) -> Result<&'a str, LockError> {
    env.get(key)
        .map(String::as_str)
        .ok_or_else(|| invalid(format!("missing field {key}")))
}

fn lock_field(env: &Envelope) -> Result<String, LockError> {
    let lock = field(env, "lock")?;
    validate_lock_name(lock)?;
    Ok(lock.to_string())
}

fn client_field(env: &Envelope) -> Result<ServerAddr, LockError> {
    let client = field(env, "clientAddr")?;
    if client.is_empty() {
        return Err(invalid("empty clientAddr"));
    }
    Ok(ServerAddr::from(client))
}

fn number<T: std::str::FromStr>(env: &Envelope, key: &str) -> Result<T, LockError> {
    let raw = field(env, key)?;
    raw.parse()
        .map_err(|_| invalid(format!("field {key} is not a number: {raw:?}")))
}

fn split(env: &Envelope, key: &str) -> Vec<String> {
    match env.get(key).map(String::as_str) {
        None | Some("") => Vec::new(),
        Some(raw) => raw.split(LIST_DELIMITER).map(str::to_string).collect(),
    }
}

fn lock_list(env: &Envelope, key: &str) -> Result<Vec<String>, LockError> {
    let locks = split(env, key);
    if locks.iter().any(String::is_empty) {
        return Err(invalid(format!("field {key} contains an empty lock name")));
    }
    Ok(locks)
}

fn number_list(env: &Envelope, key: &str) -> Result<Vec<u64>, LockError> {
    split(env, key)
        .iter()
        .map(|raw| {
            raw.parse()
                .map_err(|_| invalid(format!("field {key} has non-numeric entry {raw:?}")))
        })
        .collect()
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(";")
}

/// Per-shard load as seen by the master.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupLoad {
    pub group: GroupId,
    pub load: f64,
    pub locks: usize,
    pub pending_migrations: usize,
}

/// Reply record shared by every function; unused fields are omitted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequencer: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerAddr>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ready: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deferred: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub loads: Vec<GroupLoad>,
    pub err_message: String,
}

impl Response {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(err: &LockError) -> Self {
        Self {
            err_message: err.to_wire(),
            ..Self::default()
        }
    }

    pub fn sequencer(sequencer: u64) -> Self {
        Self {
            sequencer: Some(i64::try_from(sequencer).unwrap_or(i64::MAX)),
            ..Self::default()
        }
    }

    /// Failed acquire: error plus the invalid sequencer sentinel.
    pub fn acquire_failed(err: &LockError) -> Self {
        Self {
            sequencer: Some(INVALID_SEQUENCER),
            ..Self::error(err)
        }
    }

    pub fn into_result(self) -> Result<Self, LockError> {
        match LockError::from_wire(&self.err_message) {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|err| {
            tracing::error!(error = ?err, "response encode failed");
            Vec::new()
        })
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Envelope {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn decodes_flat_envelope() {
        let cmd = Command::from_envelope(&env(&[
            ("function", "FrequencyUpdate"),
            ("group", "2"),
            ("lockArray", "/a/x;/a/y"),
            ("countArray", "5;7"),
        ]))
        .expect("decode");
        match cmd {
            Command::FrequencyUpdate {
                group,
                locks,
                counts,
            } => {
                assert_eq!(group, 2);
                assert_eq!(locks, vec!["/a/x", "/a/y"]);
                assert_eq!(counts, vec![5, 7]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn empty_list_field_is_empty_vec() {
        let cmd = Command::from_envelope(&env(&[
            ("function", "ClaimLocks"),
            ("lockArray", "L"),
            ("sequencerArray", ""),
        ]))
        .expect("decode");
        assert_eq!(
            cmd,
            Command::ClaimLocks {
                locks: vec!["L".to_string()],
                sequencers: Vec::new(),
            }
        );
    }

    #[test]
    fn claim_with_seeds_survives_the_wire() {
        let cmd = Command::ClaimLocks {
            locks: vec!["/a/x".to_string(), "/a/y".to_string()],
            sequencers: vec![4, 0],
        };
        let bytes = encode_command(&cmd).expect("encode");
        let text = String::from_utf8(bytes.clone()).expect("utf8");
        assert!(text.contains("\"lockArray\":\"/a/x;/a/y\""), "{text}");
        assert_eq!(decode_command(&bytes).expect("decode"), cmd);
    }

    #[test]
    fn malformed_envelopes_are_invalid_requests() {
        let cases = [
            env(&[("function", "Nope")]),
            env(&[("lock", "L")]),
            env(&[("function", "AcquireLock"), ("lock", "L")]),
            env(&[("function", "AcquireLock"), ("lock", ""), ("clientAddr", "c")]),
            env(&[("function", "CreateLock"), ("lock", "a;b")]),
            env(&[("function", "ValidateLock"), ("lock", "L"), ("sequencer", "x")]),
            env(&[
                ("function", "FrequencyUpdate"),
                ("group", "1"),
                ("lockArray", "a;b"),
                ("countArray", "1"),
            ]),
            env(&[("function", "DisownLocks"), ("lockArray", "a;;b")]),
        ];
        for case in cases {
            match Command::from_envelope(&case) {
                Err(LockError::InvalidRequest(_)) => {}
                other => panic!("expected InvalidRequest for {case:?}, got {other:?}"),
            }
        }
        assert!(matches!(
            decode_command(b"not json"),
            Err(LockError::InvalidRequest(_))
        ));
    }

    #[test]
    fn response_uses_camel_case_and_omits_unused_fields() {
        let text = String::from_utf8(Response::acquire_failed(&LockError::LockHeld).encode())
            .expect("utf8");
        assert_eq!(text, r#"{"sequencer":-1,"errMessage":"LockHeld"}"#);
        let ok = Response::decode(br#"{"sequencer":3,"errMessage":""}"#).expect("decode");
        assert_eq!(ok.into_result().expect("ok").sequencer, Some(3));
    }
}
