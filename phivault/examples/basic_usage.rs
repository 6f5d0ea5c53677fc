//! Basic usage example for `PhiVault`.

use phivault::prelude::*;
use phivault_key_file::FileKeyGateway;
use secrecy::SecretVec;
use serde_json::json;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("PhiVault Basic Usage Example");
    println!("============================\n");

    // Setup: a local key directory stands in for a managed key service
    let key_dir = PathBuf::from("./example_keys");

    if !key_dir.exists() {
        println!("Initializing key directory at {}...", key_dir.display());
        FileKeyGateway::init(&key_dir)?;
        println!("✓ Key directory initialized\n");
    }

    let gateway = FileKeyGateway::new(&key_dir)?;
    let master_key_id = gateway.master_key_ids()?.pop().ok_or("no master key")?;
    let service = EnvelopeService::new(gateway, master_key_id);
    println!("✓ EnvelopeService created (master key {:?})\n", service.master_key_id());

    // Seal and open a single value
    let sealed = service.seal("Right lower lobe consolidation").await?;
    println!("Encrypted field:\n{}\n", serde_json::to_string_pretty(&sealed)?);

    let opened = service.open_field(&sealed).await?;
    assert_eq!(opened, "Right lower lobe consolidation");
    println!("✓ Round-trip verification successful\n");

    // The index key would normally come from FINDING_INDEX_KEY_BASE64
    let indexer = BlindIndexer::new(SecretVec::new(vec![7u8; 32]))?;

    let codec = RecordCodec::new(
        service,
        vec![
            FieldSpec::scalar("finding").indexed(Normalization::Trimmed),
            FieldSpec::scalar("impression"),
            FieldSpec::bundle("patient_demographics", ["age", "sex"]),
        ],
        Some(indexer),
    )?;

    let record = json!({
        "id": 1,
        "finding": "Pneumothorax",
        "impression": "Small apical pneumothorax, no shift.",
        "age": 54,
        "sex": "F",
    });
    let Some(record) = record.as_object().cloned() else {
        return Err("record must be an object".into());
    };

    let stored = codec.to_storage(record).await?;
    println!("Stored columns:");
    for column in stored.keys() {
        println!("  - {column}");
    }

    let tag = codec.lookup_index("finding", " Pneumothorax ")?;
    assert_eq!(stored["finding_index"], json!(tag));
    println!("\n✓ Index lookup matches stored row\n");

    let decoded = codec.from_storage(stored).await?;
    println!("Decoded record:\n{}", serde_json::to_string_pretty(&decoded)?);

    println!("\n============================");
    println!("All operations successful! 🎉");
    println!("\nNote: Key directory at {} can be deleted manually", key_dir.display());

    Ok(())
}
