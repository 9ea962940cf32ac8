// =============================================================================
// UserStore — token-authenticated per-user filter configuration
// =============================================================================
//
// Users are persisted as a flat JSON document keyed by user_id. Each user
// carries a bearer token, an optional chat id for the chat sink, and a
// filter config map: the allow-listed keys from `allowed_filters`, plus a
// couple of non-allow-listed enable-flags (`mark_delta`, `atr_impulse`)
// that default on and can't be changed by a patch. Patches are flattened to
// dotted keys, validated against the allow-list (unknown keys dropped,
// values snapped to the nearest exact enum match), deep-merged over the
// existing config, and the whole store is rewritten atomically.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

/// Canonical allow-listed filter keys and their enumerated legal values.
///
/// The first value of each entry is the default applied to a user who has
/// never overridden that key.
pub fn allowed_filters() -> &'static HashMap<&'static str, &'static [f64]> {
    static TABLE: std::sync::OnceLock<HashMap<&'static str, &'static [f64]>> = std::sync::OnceLock::new();
    TABLE.get_or_init(|| {
        let mut m: HashMap<&'static str, &'static [f64]> = HashMap::new();
        m.insert("volume_threshold", &[10e6, 20e6, 50e6, 100e6, 200e6, 500e6]);
        m.insert("min_trades_24h", &[10_000.0, 50_000.0, 100_000.0, 200_000.0]);
        m.insert("orderbook_min_bid", &[20_000.0, 50_000.0, 100_000.0, 200_000.0]);
        m.insert("orderbook_min_ask", &[20_000.0, 50_000.0, 100_000.0, 200_000.0]);
        m.insert("impulse_trades", &[100.0, 200.0, 500.0, 1000.0]);
        m
    })
}

/// JSON-serializable view of the allow-list, for the `get_allowed_filters`
/// wire response.
pub fn allowed_filters_json() -> Value {
    let mut obj = Map::new();
    for (k, values) in allowed_filters() {
        obj.insert((*k).to_string(), serde_json::json!(values));
    }
    Value::Object(obj)
}

/// Extra per-user flags carried over from the original's nested config
/// (`mark_delta`, `atr_impulse`) that enable alert sub-kinds the engine
/// does not yet gate delivery on. They default on, are not part of
/// [`allowed_filters`], and `validate_patch` drops any attempt to change
/// them via `set_config` (flattened keys like `mark_delta.enabled` match
/// no allow-listed key).
fn default_filter_config() -> Map<String, Value> {
    let mut obj = Map::new();
    for (k, values) in allowed_filters() {
        obj.insert((*k).to_string(), serde_json::json!(values[0]));
    }
    obj.insert("mark_delta".to_string(), serde_json::json!({ "enabled": true }));
    obj.insert("atr_impulse".to_string(), serde_json::json!({ "enabled": true }));
    obj
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    token: String,
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default = "default_filter_config")]
    filters: Map<String, Value>,
    #[serde(default)]
    created_at: f64,
    #[serde(default)]
    updated_at: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoreFile {
    #[serde(default)]
    users: HashMap<String, UserRecord>,
}

/// A resolved user profile as consumed by the engine's delivery path.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub user_id: String,
    pub token: String,
    pub chat_id: Option<String>,
    pub filters: Map<String, Value>,
}

/// Flatten nested JSON objects to dotted keys: `{"a": {"b": 1}}` -> `{"a.b": 1}`.
fn flatten(value: &Map<String, Value>, prefix: &str) -> Map<String, Value> {
    let mut out = Map::new();
    for (k, v) in value {
        let key = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        match v {
            Value::Object(nested) => out.extend(flatten(nested, &key)),
            other => {
                out.insert(key, other.clone());
            }
        }
    }
    out
}

/// Inverse of [`flatten`]: `{"a.b": 1}` -> `{"a": {"b": 1}}`.
fn unflatten(flat: &Map<String, Value>) -> Map<String, Value> {
    let mut root = Map::new();
    for (key, v) in flat {
        let parts: Vec<&str> = key.split('.').collect();
        let mut cur = &mut root;
        for part in &parts[..parts.len() - 1] {
            cur = cur
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()))
                .as_object_mut()
                .expect("intermediate path segment overwritten by a leaf value");
        }
        cur.insert(parts[parts.len() - 1].to_string(), v.clone());
    }
    root
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

/// Drop keys outside the allow-list; snap surviving values to their nearest
/// exact enum match, dropping any value that matches none.
fn validate_patch(patch: &Map<String, Value>) -> Map<String, Value> {
    let flat = flatten(patch, "");
    let table = allowed_filters();
    let mut accepted = Map::new();

    for (key, value) in &flat {
        let Some(allowed_values) = table.get(key.as_str()) else {
            continue;
        };
        let Some(v) = as_f64(value) else { continue };
        if let Some(&matched) = allowed_values.iter().find(|a| (**a - v).abs() < 1e-9) {
            accepted.insert(key.clone(), serde_json::json!(matched));
        }
    }

    unflatten(&accepted)
}

fn deep_merge(dst: &mut Map<String, Value>, src: &Map<String, Value>) {
    for (k, v) in src {
        match (dst.get_mut(k), v) {
            (Some(Value::Object(dst_obj)), Value::Object(src_obj)) => deep_merge(dst_obj, src_obj),
            _ => {
                dst.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Persisted, token-authenticated per-user filter configuration.
///
/// All access is serialized behind a single lock (spec.md §5: reads may be
/// concurrent in principle, but writes must be serialized and the response
/// must reflect the post-write state, which a single lock trivially
/// guarantees).
pub struct UserStore {
    path: PathBuf,
    data: RwLock<StoreFile>,
}

impl UserStore {
    /// Load the store from `path`, creating an empty one if absent.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read user store at {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse user store at {}", path.display()))?
        } else {
            StoreFile::default()
        };

        let store = Self {
            path,
            data: RwLock::new(data),
        };
        store.save()?;
        Ok(store)
    }

    fn save(&self) -> Result<()> {
        let content =
            serde_json::to_string_pretty(&*self.data.read()).context("failed to serialise user store")?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp user store to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp user store to {}", self.path.display()))?;
        Ok(())
    }

    /// Resolve a bearer token to a user id, or `None` if unrecognized.
    pub fn resolve_token(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }
        self.data
            .read()
            .users
            .iter()
            .find(|(_, rec)| rec.token == token)
            .map(|(uid, _)| uid.clone())
    }

    /// Current merged filter config for `user_id` (defaults for any key the
    /// user has never overridden).
    pub fn get_user_cfg(&self, user_id: &str) -> Map<String, Value> {
        let data = self.data.read();
        match data.users.get(user_id) {
            Some(rec) => rec.filters.clone(),
            None => default_filter_config(),
        }
    }

    /// Validate and deep-merge `patch` over the user's stored config,
    /// persist, and return the merged result.
    pub fn patch_user_cfg(&self, user_id: &str, patch: &Map<String, Value>, now: f64) -> Result<Map<String, Value>> {
        let safe_patch = validate_patch(patch);

        let merged = {
            let mut data = self.data.write();
            let rec = data.users.entry(user_id.to_string()).or_insert_with(|| UserRecord {
                token: String::new(),
                chat_id: None,
                filters: default_filter_config(),
                created_at: now,
                updated_at: now,
            });
            deep_merge(&mut rec.filters, &safe_patch);
            rec.updated_at = now;
            rec.filters.clone()
        };

        self.save()?;
        info!(user_id, "user config patched");
        Ok(merged)
    }

    /// Every registered user's profile (for engine delivery fanout).
    pub fn all_users(&self) -> Vec<UserProfile> {
        self.data
            .read()
            .users
            .iter()
            .map(|(uid, rec)| UserProfile {
                user_id: uid.clone(),
                token: rec.token.clone(),
                chat_id: rec.chat_id.clone(),
                filters: rec.filters.clone(),
            })
            .collect()
    }

    /// Create (or, with `overwrite`, replace) a user record. Returns the
    /// generated or supplied token.
    pub fn create_user(
        &self,
        user_id: &str,
        chat_id: Option<String>,
        token: Option<String>,
        overwrite: bool,
        now: f64,
    ) -> Result<String> {
        let mut data = self.data.write();
        if data.users.contains_key(user_id) && !overwrite {
            anyhow::bail!("user_id already exists: {user_id}");
        }

        let token = token.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        data.users.insert(
            user_id.to_string(),
            UserRecord {
                token: token.clone(),
                chat_id,
                filters: default_filter_config(),
                created_at: now,
                updated_at: now,
            },
        );
        drop(data);
        self.save()?;
        Ok(token)
    }

    /// Remove a user record. Returns `true` if a user was removed.
    pub fn remove_user(&self, user_id: &str) -> Result<bool> {
        let removed = self.data.write().users.remove(user_id).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("user_store_test_{}_{}", std::process::id(), name))
    }

    #[test]
    fn flatten_and_unflatten_roundtrip() {
        let mut nested = Map::new();
        let mut inner = Map::new();
        inner.insert("b".to_string(), serde_json::json!(1));
        nested.insert("a".to_string(), Value::Object(inner));

        let flat = flatten(&nested, "");
        assert_eq!(flat.get("a.b"), Some(&serde_json::json!(1)));

        let back = unflatten(&flat);
        assert_eq!(back, nested);
    }

    #[test]
    fn validate_patch_drops_unknown_keys() {
        let mut patch = Map::new();
        patch.insert("not_a_filter".to_string(), serde_json::json!(5));
        patch.insert("volume_threshold".to_string(), serde_json::json!(20e6));
        let out = validate_patch(&patch);
        assert!(!out.contains_key("not_a_filter"));
        assert_eq!(out.get("volume_threshold"), Some(&serde_json::json!(20e6)));
    }

    #[test]
    fn validate_patch_drops_non_enumerated_value() {
        let mut patch = Map::new();
        patch.insert("volume_threshold".to_string(), serde_json::json!(12345.0));
        let out = validate_patch(&patch);
        assert!(out.is_empty());
    }

    #[test]
    fn create_resolve_and_patch_roundtrip() {
        let path = temp_path("basic.json");
        let store = UserStore::load(&path).unwrap();
        let token = store.create_user("alice", None, None, false, 1000.0).unwrap();

        assert_eq!(store.resolve_token(&token), Some("alice".to_string()));
        assert_eq!(store.resolve_token("bogus"), None);

        let mut patch = Map::new();
        patch.insert("volume_threshold".to_string(), serde_json::json!(50e6));
        let merged = store.patch_user_cfg("alice", &patch, 1001.0).unwrap();
        assert_eq!(merged.get("volume_threshold"), Some(&serde_json::json!(50e6)));

        let cfg = store.get_user_cfg("alice");
        assert_eq!(cfg.get("volume_threshold"), Some(&serde_json::json!(50e6)));

        std::fs::remove_file(&path).ok();
        std::fs::remove_file(path.with_extension("json.tmp")).ok();
    }

    #[test]
    fn unknown_user_gets_default_cfg() {
        let path = temp_path("defaults.json");
        let store = UserStore::load(&path).unwrap();
        let cfg = store.get_user_cfg("nobody");
        assert_eq!(cfg.get("volume_threshold"), Some(&serde_json::json!(10e6)));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn mark_delta_and_atr_impulse_default_on_and_reject_patches() {
        let path = temp_path("extra_flags.json");
        let store = UserStore::load(&path).unwrap();
        store.create_user("dave", None, None, false, 1000.0).unwrap();

        let cfg = store.get_user_cfg("dave");
        assert_eq!(cfg.get("mark_delta"), Some(&serde_json::json!({ "enabled": true })));
        assert_eq!(cfg.get("atr_impulse"), Some(&serde_json::json!({ "enabled": true })));

        let mut patch = Map::new();
        patch.insert("mark_delta".to_string(), serde_json::json!({ "enabled": false }));
        let merged = store.patch_user_cfg("dave", &patch, 1001.0).unwrap();
        assert_eq!(merged.get("mark_delta"), Some(&serde_json::json!({ "enabled": true })));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn create_user_rejects_duplicate_without_overwrite() {
        let path = temp_path("dup.json");
        let store = UserStore::load(&path).unwrap();
        store.create_user("bob", None, None, false, 1000.0).unwrap();
        assert!(store.create_user("bob", None, None, false, 1000.0).is_err());
        assert!(store.create_user("bob", None, None, true, 1000.0).is_ok());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn remove_user_reports_whether_one_existed() {
        let path = temp_path("remove.json");
        let store = UserStore::load(&path).unwrap();
        store.create_user("carol", None, None, false, 1000.0).unwrap();
        assert!(store.remove_user("carol").unwrap());
        assert!(!store.remove_user("carol").unwrap());
        std::fs::remove_file(&path).ok();
    }
}
