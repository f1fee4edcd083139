use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use super::{MappingConfiguration, MappingDocument};
use crate::error::DomainError;

/// MappingLoader reads TOML mapping files into a [`MappingConfiguration`].
///
/// The path is either a single file holding `[[classes]]` and `[[relations]]`
/// tables, or a directory laid out as:
///
/// ```text
/// mapping/
/// ├── classes/order.toml        → [[classes]] tables
/// ├── classes/customer.toml
/// └── relations/orders.toml     → [[relations]] tables
/// ```
///
/// Files are merged in file-name order and validated once as a whole.
pub struct MappingLoader;

impl MappingLoader {
    pub fn load(path: &Path) -> Result<MappingConfiguration, DomainError> {
        let document = if path.is_dir() {
            Self::load_directory(path)?
        } else if path.is_file() {
            Self::read_document(path)?
        } else {
            return Err(DomainError::Mapping(format!(
                "mapping path {:?} does not exist",
                path
            )));
        };

        debug!(
            "MappingLoader: {} classes, {} relations from {:?}",
            document.classes.len(),
            document.relations.len(),
            path
        );
        MappingConfiguration::new(document)
    }

    fn load_directory(dir: &Path) -> Result<MappingDocument, DomainError> {
        let mut merged = MappingDocument::default();
        for sub in ["classes", "relations"] {
            let sub_dir = dir.join(sub);
            if !sub_dir.is_dir() {
                debug!("MappingLoader: {:?} does not exist, skipping", sub_dir);
                continue;
            }
            for path in Self::toml_files(&sub_dir)? {
                let document = Self::read_document(&path)?;
                if sub == "classes" && !document.relations.is_empty() {
                    warn!("MappingLoader: relations in {:?} are merged as well", path);
                }
                merged.classes.extend(document.classes);
                merged.relations.extend(document.relations);
            }
        }
        Ok(merged)
    }

    fn toml_files(dir: &Path) -> Result<Vec<std::path::PathBuf>, DomainError> {
        let entries = fs::read_dir(dir).map_err(|e| DomainError::Mapping(e.to_string()))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| DomainError::Mapping(e.to_string()))?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn read_document(path: &Path) -> Result<MappingDocument, DomainError> {
        let content = fs::read_to_string(path)
            .map_err(|e| DomainError::Mapping(format!("cannot read {:?}: {}", path, e)))?;
        toml::from_str(&content)
            .map_err(|e| DomainError::Mapping(format!("invalid mapping file {:?}: {}", path, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_id::ClassId;
    use tempfile::TempDir;

    const CLASSES: &str = r#"
        [[classes]]
        id = "Customer"
        properties = [{ name = "Name", kind = "text" }]

        [[classes]]
        id = "Order"
        properties = [{ name = "Customer", kind = "reference" }]
    "#;

    const RELATIONS: &str = r#"
        [[relations]]
        id = "Customer:Orders"
        end_points = [
            { class = "Customer", property = "Orders", cardinality = "many" },
            { class = "Order", property = "Customer", cardinality = "one" },
        ]
    "#;

    #[test]
    fn test_load_single_file() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("mapping.toml");
        fs::write(&file, format!("{}\n{}", CLASSES, RELATIONS)).unwrap();

        let mapping = MappingLoader::load(&file).unwrap();
        assert_eq!(mapping.classes().count(), 2);
        assert!(mapping.end_point(&ClassId::new("Customer"), "Orders").is_some());
    }

    #[test]
    fn test_load_directory() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("classes")).unwrap();
        fs::create_dir_all(tmp.path().join("relations")).unwrap();
        fs::write(tmp.path().join("classes/sales.toml"), CLASSES).unwrap();
        fs::write(tmp.path().join("relations/sales.toml"), RELATIONS).unwrap();
        fs::write(tmp.path().join("classes/README.md"), "ignored").unwrap();

        let mapping = MappingLoader::load(tmp.path()).unwrap();
        assert_eq!(mapping.relations().len(), 1);
    }

    #[test]
    fn test_missing_path() {
        let err = MappingLoader::load(Path::new("/nonexistent/mapping")).unwrap_err();
        assert!(matches!(err, DomainError::Mapping(_)));
    }

    #[test]
    fn test_directory_validated_as_a_whole() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("classes")).unwrap();
        fs::write(tmp.path().join("classes/sales.toml"), CLASSES).unwrap();

        // Order.Customer has no relation without the relations/ directory.
        let err = MappingLoader::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("not part of any relation"));
    }
}
