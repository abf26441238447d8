use std::sync::Arc;

use pretty_assertions::assert_eq;
use rowstream::embedder::{Embedder, HashEmbedder};
use rowstream::{
    batch_by_size, embed_texts, parse_message_body, EmbedMode, MetadataValue, VectorRecord,
    MAX_UPSERT_BYTES,
};
use serde_json::json;

async fn record_for(body: &str, embedder: &Arc<dyn Embedder>) -> VectorRecord {
    let input = parse_message_body(body)
        .expect("parse body")
        .embedder_input()
        .expect("build input");
    let vectors = embed_texts(embedder, &[input.text.clone()], EmbedMode::Serial, 1)
        .await
        .expect("embed");
    VectorRecord {
        id: input.vector_id(),
        values: vectors.into_iter().next().expect("one vector"),
        metadata: input.metadata,
    }
}

#[tokio::test]
async fn change_message_becomes_one_keyed_record() {
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(384));
    let body = json!({"new": {"id": "7", "description": "blue hat", "sku": "SKU-1"}}).to_string();

    let record = record_for(&body, &embedder).await;
    assert_eq!(record.id, "7");
    assert_eq!(record.values.len(), 384);
    assert_eq!(
        record.metadata.get("id"),
        Some(&MetadataValue::Str("7".into()))
    );
    assert_eq!(record.metadata.get("description"), None);

    let batches = batch_by_size(vec![record], MAX_UPSERT_BYTES);
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
}

#[tokio::test]
async fn duplicate_delivery_converges_on_one_record() {
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(128));
    let body =
        json!({"new": {"id": 42, "description": "red shoes", "price": 129.5}}).to_string();

    let first = record_for(&body, &embedder).await;
    let second = record_for(&body, &embedder).await;
    // Same id and identical content: the second upsert overwrites the first
    // instead of creating a divergent record.
    assert_eq!(first, second);
    assert_eq!(first.id, "42");
}

#[tokio::test]
async fn bridge_and_direct_shapes_converge() {
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
    let direct = json!({"new": {"id": 9, "description": "green scarf"}}).to_string();
    let bridged = json!({
        "channel": "table_change",
        "payload": json!({"new": {"id": 9, "description": "green scarf"}}).to_string(),
    })
    .to_string();

    let from_direct = record_for(&direct, &embedder).await;
    let from_bridge = record_for(&bridged, &embedder).await;
    assert_eq!(from_direct, from_bridge);
}

#[tokio::test]
async fn batching_preserves_every_record_across_batches() {
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(256));
    let mut records = Vec::new();
    for id in 0..30 {
        let body = json!({"new": {"id": id, "description": format!("product {id}")}}).to_string();
        records.push(record_for(&body, &embedder).await);
    }

    let per_record = records[0].serialized_size();
    let batches = batch_by_size(records.clone(), per_record * 7);
    assert!(batches.len() > 1);
    for batch in &batches {
        let bytes: usize = batch.iter().map(VectorRecord::serialized_size).sum();
        assert!(bytes <= per_record * 7);
    }
    let reassembled: Vec<VectorRecord> = batches.into_iter().flatten().collect();
    assert_eq!(reassembled, records);
}
