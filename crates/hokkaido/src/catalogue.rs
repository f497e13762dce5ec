//! `collections` subcommand.

use hokkaido_sync::{CacheKey, Collection, targets};
use miette::{IntoDiagnostic, Result};
use serde_json::{Value, json};

fn describe_keys(keys: &[CacheKey]) -> Vec<String> {
    keys.iter()
        .map(|key| match key {
            CacheKey::Exact(key) => key.to_string(),
            CacheKey::Prefix(prefix) => format!("{prefix}*"),
        })
        .collect()
}

fn describe(collection: Collection) -> Value {
    let targets = targets(collection);
    json!({
        "collection": collection.as_str(),
        "ttlSecs": collection.default_ttl().as_secs(),
        "stateKeys": targets.state_keys,
        "legacyKeys": describe_keys(targets.legacy_keys),
        "queryKeys": describe_keys(targets.query_keys),
        "repository": targets.repository,
        "statusCache": targets.status_cache,
        "events": targets.events,
    })
}

pub fn print() -> Result<()> {
    let catalogue: Vec<Value> = Collection::ALL.iter().copied().map(describe).collect();
    let rendered = serde_json::to_string_pretty(&catalogue).into_diagnostic()?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_describe_marks_prefix_keys() {
        let described = describe(Collection::Planning);
        assert_eq!(described["collection"], json!("planning"));
        assert_eq!(described["ttlSecs"], json!(120));
        assert_eq!(described["queryKeys"], json!(["plan_*"]));
    }

    #[test]
    fn test_system_logs_have_no_targets() {
        let described = describe(Collection::SystemLogs);
        assert_eq!(described["stateKeys"], json!([]));
        assert_eq!(described["events"], json!([]));
        assert_eq!(described["repository"], json!(false));
    }
}
