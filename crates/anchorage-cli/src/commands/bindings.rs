use anyhow::{Context, Result};

use anchorage_core::{registry, CollectionBinding};
use anchorage_store::Config;

use super::{connect, parse_distance};

/// Print the model registry, optionally filtered by width.
pub fn list_models(width: Option<usize>) {
    let models: Vec<_> = registry::list()
        .iter()
        .filter(|m| width.map_or(true, |w| m.width == w))
        .collect();

    if models.is_empty() {
        println!("No models produce {}-dimensional vectors", width.unwrap_or_default());
        return;
    }

    for model in models {
        println!(
            "{:<48} {:>5}  {:<9}  {}",
            model.name,
            model.width,
            model.provider.as_str(),
            model.description
        );
    }
}

fn print_binding(binding: &CollectionBinding) {
    println!("  Collection: {}", binding.collection);
    println!("  Model: {}", binding.model);
    if let Ok(model) = registry::resolve_by_name(&binding.model) {
        println!("  Width: {}", model.width);
    }
    println!("  Distance: {}", binding.distance);
    println!("  Bound at: {}", binding.created_at.to_rfc3339());
}

pub async fn bind(
    config: &Config,
    collection: &str,
    model: Option<String>,
    width: Option<usize>,
    distance: Option<String>,
) -> Result<()> {
    let distance = parse_distance(distance.as_deref())?;
    let broker = connect(config).await?;
    let binding = broker
        .create_collection(collection, model.as_deref(), width, distance)
        .await
        .with_context(|| format!("Failed to bind '{}'", collection))?;

    println!("✓ Bound {}\n", collection);
    print_binding(&binding);
    Ok(())
}

pub async fn rebind(
    config: &Config,
    collection: &str,
    model: &str,
    distance: Option<String>,
) -> Result<()> {
    let distance = parse_distance(distance.as_deref())?.unwrap_or(config.default_distance);
    let broker = connect(config).await?;
    let binding = broker
        .associations()
        .override_binding(collection, model, distance)
        .await
        .with_context(|| format!("Failed to rebind '{}'", collection))?;

    println!("✓ Rebound {}\n", collection);
    print_binding(&binding);
    println!("\n  Existing vectors were not re-embedded. Recreate the collection's");
    println!("  contents before searching it.");
    Ok(())
}

pub async fn show_binding(config: &Config, collection: &str) -> Result<()> {
    let broker = connect(config).await?;
    match broker.associations().get_binding(collection).await? {
        Some(binding) => print_binding(&binding),
        None => println!("{} is not bound", collection),
    }
    Ok(())
}

pub async fn show_info(config: &Config, collection: &str, json: bool) -> Result<()> {
    let broker = connect(config).await?;
    let report = broker
        .collection_info(collection)
        .await
        .with_context(|| format!("Failed to inspect '{}'", collection))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    let Some(report) = report else {
        println!("{} does not exist and is not bound", collection);
        return Ok(());
    };

    match &report.binding {
        Some(binding) => print_binding(binding),
        None => {
            println!("  Collection: {}", report.collection);
            println!("  Model: <unbound>");
        }
    }
    match &report.physical {
        Some(info) => {
            println!("  Stored width: {}", info.width);
            println!("  Stored distance: {}", info.distance);
            println!("  Points: {}", info.points);
        }
        None => println!("  Not yet created in the store"),
    }
    Ok(())
}

pub async fn unbind(config: &Config, collection: &str) -> Result<()> {
    let broker = connect(config).await?;
    broker
        .delete_collection(collection)
        .await
        .with_context(|| format!("Failed to delete '{}'", collection))?;
    println!("✓ Deleted {} and its binding", collection);
    Ok(())
}
