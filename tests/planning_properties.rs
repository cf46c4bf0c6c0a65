use chrono::Utc;
use proptest::prelude::*;
use routeplane::domain::{RegisterMode, UpstreamApi, UpstreamApiId, UpstreamId};
use routeplane::services::domain_registry::normalize_domains;
use routeplane::services::upstream::plan_generation;
use sqlx::types::Json;

fn api(name: &str, api_id: &str) -> UpstreamApi {
    UpstreamApi {
        id: UpstreamApiId::new(),
        upstream_id: UpstreamId::from("u1"),
        register_id: "r".to_string(),
        api_name: name.to_string(),
        path: name.to_string(),
        gateway_path: String::new(),
        method: "GET".to_string(),
        address: "http://svc:8080".to_string(),
        domains: String::new(),
        doc: Json(serde_json::Value::Null),
        is_inner: false,
        api_id: api_id.to_string(),
        deleted: false,
        created_at: Utc::now(),
    }
}

fn names() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set("/[a-z]{1,6}", 0..8).prop_map(|set| set.into_iter().collect())
}

proptest! {
    #[test]
    fn normalized_domains_are_unique_and_stable(domains in prop::collection::vec("[a-c]{1,3}\\.example\\.com", 0..10)) {
        let once = normalize_domains(&domains);
        let mut dedup = once.clone();
        dedup.dedup();
        prop_assert_eq!(&once, &dedup);
        prop_assert_eq!(normalize_domains(&once), once);
    }

    #[test]
    fn replace_plan_accounts_for_every_entry(old in names(), new in names()) {
        let old: Vec<UpstreamApi> = old.iter().enumerate().map(|(i, n)| api(n, &format!("g{}", i))).collect();
        let new: Vec<UpstreamApi> = new.iter().map(|n| api(n, "")).collect();
        let plan = plan_generation(&old, &new, RegisterMode::Replace);

        prop_assert_eq!(plan.adds.len() + plan.unchanged.len() + plan.updates.len(), new.len());
        prop_assert_eq!(plan.unchanged.len() + plan.updates.len() + plan.dels.len(), old.len());
        prop_assert!(plan.carried.is_empty());
    }

    #[test]
    fn append_plan_never_deletes(old in names(), new in names()) {
        let old: Vec<UpstreamApi> = old.iter().enumerate().map(|(i, n)| api(n, &format!("g{}", i))).collect();
        let new: Vec<UpstreamApi> = new.iter().map(|n| api(n, "")).collect();
        let plan = plan_generation(&old, &new, RegisterMode::Append);

        prop_assert!(plan.dels.is_empty());
        prop_assert_eq!(plan.unchanged.len() + plan.carried.len(), old.len());
    }

    #[test]
    fn identical_generation_is_noop(names in names()) {
        let old: Vec<UpstreamApi> = names.iter().enumerate().map(|(i, n)| api(n, &format!("g{}", i))).collect();
        let new: Vec<UpstreamApi> = names.iter().map(|n| api(n, "")).collect();
        let plan = plan_generation(&old, &new, RegisterMode::Replace);
        prop_assert!(plan.is_noop());
    }
}
