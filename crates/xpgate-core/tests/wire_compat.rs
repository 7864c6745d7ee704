use rust_decimal::Decimal;
use std::fs;
use std::path::PathBuf;
use xpgate_core::{
    Decision, Fingerprint, Persona, Policy, PolicyDocument, ReasonCode, RewardRequest, RewardType,
};

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()))
}

#[test]
fn stored_decision_still_deserializes() {
    let decision: Decision = serde_json::from_str(&fixture("stored_decision.json"))
        .expect("stored decision must stay readable");

    assert_eq!(decision.persona, Persona::Returning);
    assert_eq!(decision.reward_type, RewardType::Checkout);
    assert_eq!(decision.reward_value, Decimal::new(5000, 2));
    assert!(decision.has_reason(ReasonCode::CheckoutReward));

    let response = decision.to_response();
    assert_eq!(response.meta.transaction_id, "txn_001");
    assert_eq!(response.xp, 150);
    let wire = serde_json::to_value(&response).expect("response serializes");
    assert_eq!(wire["reason_codes"][0], "RETURNING_USER");
    assert!(wire.get("created_at").is_none());
}

#[test]
fn legacy_policy_keys_are_accepted() {
    let doc: PolicyDocument =
        serde_json::from_str(&fixture("legacy_policy.json")).expect("legacy policy parses");
    let policy = Policy::from_document(&doc).expect("legacy policy validates");

    let default = Policy::from_document(&PolicyDocument::default()).expect("default validates");
    assert_eq!(policy.to_document(), default.to_document());
}

#[test]
fn equivalent_amounts_share_a_fingerprint() {
    let requests: Vec<RewardRequest> = fixture("requests.jsonl")
        .lines()
        .map(|line| serde_json::from_str(line).expect("request parses"))
        .collect();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r.validate().is_ok()));

    // Integer and two-decimal spellings of one amount, plus a timestamp.
    assert_eq!(Fingerprint::of(&requests[0]), Fingerprint::of(&requests[1]));
    assert_ne!(Fingerprint::of(&requests[0]), Fingerprint::of(&requests[2]));
}
