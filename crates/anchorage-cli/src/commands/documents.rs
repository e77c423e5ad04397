use anyhow::{Context, Result};

use anchorage_search::BatchEntry;
use anchorage_store::Config;

use super::connect;

/// Parse `--metadata` as a JSON value.
fn parse_metadata(raw: Option<&str>) -> Result<Option<serde_json::Value>> {
    raw.map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--metadata must be valid JSON")
}

pub async fn store(
    config: &Config,
    collection: &str,
    texts: Vec<String>,
    metadata: Option<String>,
    model: Option<String>,
    width: Option<usize>,
) -> Result<()> {
    let metadata = parse_metadata(metadata.as_deref())?;
    let broker = connect(config).await?;

    if let [text] = texts.as_slice() {
        let id = broker
            .store(collection, text, metadata, model.as_deref(), width)
            .await
            .with_context(|| format!("Failed to store into '{}'", collection))?;
        println!("✓ Stored {}", id);
        return Ok(());
    }

    let entries = texts
        .into_iter()
        .map(|text| {
            let entry = BatchEntry::new(text);
            match &metadata {
                Some(m) => entry.with_metadata(m.clone()),
                None => entry,
            }
        })
        .collect();
    let count = broker
        .store_batch(collection, entries, model.as_deref(), width)
        .await
        .with_context(|| format!("Failed to store into '{}'", collection))?;
    println!("✓ Stored {} documents in {}", count, collection);
    Ok(())
}

pub async fn find(
    config: &Config,
    collection: &str,
    query: &str,
    limit: Option<usize>,
    min_score: Option<f32>,
    json: bool,
) -> Result<()> {
    let broker = connect(config).await?;
    let hits = broker
        .find_with_threshold(collection, query, limit, min_score)
        .await
        .with_context(|| format!("Failed to search '{}'", collection))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }

    if hits.is_empty() {
        println!("No results");
        return Ok(());
    }
    for (rank, hit) in hits.iter().enumerate() {
        println!(
            "{:>3}. [{:.4}] {}",
            rank + 1,
            hit.score,
            hit.document.as_deref().unwrap_or("<no document>")
        );
        if let Some(metadata) = &hit.metadata {
            println!("       {}", metadata);
        }
    }
    Ok(())
}

pub async fn scroll(
    config: &Config,
    collection: &str,
    limit: Option<usize>,
    offset: Option<&str>,
    json: bool,
) -> Result<()> {
    let broker = connect(config).await?;
    let page = broker
        .scroll(collection, limit, offset)
        .await
        .with_context(|| format!("Failed to read '{}'", collection))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }

    if page.documents.is_empty() {
        println!("No documents");
        return Ok(());
    }
    for doc in &page.documents {
        println!(
            "{:<38} {}",
            doc.id,
            doc.document.as_deref().unwrap_or("<no document>")
        );
        if let Some(metadata) = &doc.metadata {
            println!("{:<38} {}", "", metadata);
        }
    }
    if let Some(next) = &page.next_offset {
        println!("\nMore documents: --offset {}", next);
    }
    Ok(())
}

pub async fn list_collections(config: &Config) -> Result<()> {
    let broker = connect(config).await?;
    let mut names = broker.list_collections().await?;
    names.sort();

    if names.is_empty() {
        println!("No collections");
        return Ok(());
    }
    for name in names {
        match broker.associations().get_binding(&name).await? {
            Some(binding) => println!("{:<32} {} ({})", name, binding.model, binding.distance),
            None => println!("{:<32} <unbound>", name),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata() {
        assert!(parse_metadata(None).unwrap().is_none());
        let value = parse_metadata(Some(r#"{"lang":"en"}"#)).unwrap().unwrap();
        assert_eq!(value["lang"], "en");
        assert!(parse_metadata(Some("{not json")).is_err());
    }
}
