//! Read-only commands against a mapping and a redb store.
//!
//! Every command opens its own root transaction and discards it afterwards;
//! nothing is ever committed.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use domobj_client::ClientTransaction;
use domobj_core::{EndPointKind, EngineConfig, MappingConfiguration, MappingLoader, ObjectId, PropertyValue};
use domobj_storage::{Query, RedbStorageProvider};
use serde_json::json;
use tracing::info;

use super::output::{print_json, print_table};

fn load_mapping(config: &EngineConfig) -> Result<Arc<MappingConfiguration>> {
    let path = config.resolve_mapping_path();
    let mapping = MappingLoader::load(&path)
        .with_context(|| format!("failed to load mapping from {}", path.display()))?;
    Ok(Arc::new(mapping))
}

fn open_transaction(config: &EngineConfig) -> Result<ClientTransaction<'static>> {
    let mapping = load_mapping(config)?;
    let db_path = config.resolve_db_path();
    info!("Opening store {}", db_path.display());
    let provider = RedbStorageProvider::open(&db_path)
        .with_context(|| format!("failed to open store {}", db_path.display()))?;
    Ok(ClientTransaction::new_root(mapping, Arc::new(provider)))
}

fn parse_id(id: &str) -> Result<ObjectId> {
    id.parse::<ObjectId>()
        .with_context(|| format!("invalid object id: {}", id))
}

fn cell(value: &PropertyValue) -> String {
    match value {
        PropertyValue::Null => "-".to_string(),
        other => other.to_string(),
    }
}

/// `domobj check`
pub fn check(config: &EngineConfig, json: bool) -> Result<()> {
    let mapping = load_mapping(config)?;
    if json {
        let classes: Vec<_> = mapping.classes().map(|c| c.as_ref()).collect();
        return print_json(&json!({
            "classes": classes,
            "relations": mapping.relations(),
        }));
    }

    let rows: Vec<Vec<String>> = mapping
        .classes()
        .map(|c| {
            let relations: Vec<String> = mapping
                .end_points_of(&c.id)
                .iter()
                .map(|ep| format!("{}->{}", ep.property, ep.opposite_class_id))
                .collect();
            vec![
                c.id.to_string(),
                c.key_type.type_name().to_string(),
                c.properties.len().to_string(),
                relations.join(", "),
            ]
        })
        .collect();
    print_table(&["CLASS", "KEY", "PROPERTIES", "RELATIONS"], &rows);
    println!("Mapping OK: {} classes, {} relations.", rows.len(), mapping.relations().len());
    Ok(())
}

/// `domobj get <id>`
pub fn get(config: &EngineConfig, id: &str, json: bool) -> Result<()> {
    let id = parse_id(id)?;
    let mut tx = open_transaction(config)?;
    let container = tx.get_object(&id)?;

    if json {
        return print_json(&json!({
            "id": container.id(),
            "timestamp": container.timestamp(),
            "values": container.to_value_map(),
        }));
    }

    let mut rows = vec![vec!["id".to_string(), container.id().to_string()]];
    if let Some(ts) = container.timestamp() {
        rows.push(vec!["timestamp".to_string(), ts.0.to_string()]);
    }
    for (name, value) in container.to_value_map() {
        rows.push(vec![name, cell(&value)]);
    }
    print_table(&["PROPERTY", "VALUE"], &rows);
    Ok(())
}

/// `domobj list <class>`
pub fn list(
    config: &EngineConfig,
    class: &str,
    columns: &[String],
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let mut tx = open_transaction(config)?;
    let mut query = Query::new(class);
    if let Some(limit) = limit {
        query = query.limit(limit);
    }
    tx.mapping().class(&query.class_id)?;
    let rows = tx.query_rows(&query, columns)?;

    if json {
        return print_json(&rows);
    }

    let mut headers: Vec<String> = vec!["id".to_string()];
    if columns.is_empty() {
        let names: BTreeSet<&String> = rows
            .iter()
            .flat_map(|r| r.keys())
            .filter(|k| k.as_str() != "id")
            .collect();
        headers.extend(names.into_iter().cloned());
    } else {
        headers.extend(columns.iter().cloned());
    }
    let table: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            headers
                .iter()
                .map(|h| row.get(h).map(cell).unwrap_or_else(|| "-".to_string()))
                .collect()
        })
        .collect();
    let header_refs: Vec<&str> = headers.iter().map(String::as_str).collect();
    print_table(&header_refs, &table);
    Ok(())
}

/// `domobj related <id> <property>`
pub fn related(config: &EngineConfig, id: &str, property: &str, json: bool) -> Result<()> {
    let id = parse_id(id)?;
    let mut tx = open_transaction(config)?;
    let def = tx.mapping().require_end_point(id.class_id(), property)?.clone();
    let related: Vec<ObjectId> = match def.kind {
        EndPointKind::Collection => tx.related_objects(&id, property)?,
        EndPointKind::RealObject | EndPointKind::VirtualObject => {
            tx.related_object(&id, property)?.into_iter().collect()
        }
    };

    if json {
        return print_json(&related);
    }
    let rows: Vec<Vec<String>> = related.iter().map(|r| vec![r.to_string()]).collect();
    print_table(&[def.opposite_class_id.as_str()], &rows);
    Ok(())
}
