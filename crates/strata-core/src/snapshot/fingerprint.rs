//! Content-addressed identity for model definitions.

use std::collections::HashMap;

use indexmap::IndexMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dag::Dag;
use crate::errors::{StrataError, StrataResult};
use crate::models::ModelDefinition;

/// Hex characters kept from each SHA-256 digest.
const HASH_LEN: usize = 16;

/// Stable hash over an ordered list of values.
///
/// Each value is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn hash_values<I, S>(values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for value in values {
        let bytes = value.as_ref().as_bytes();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..HASH_LEN].to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub data_hash: String,
    pub metadata_hash: String,
    pub parent_data_hash: String,
    pub parent_metadata_hash: String,
}

impl Fingerprint {
    /// Short identifier folded from all four hashes.
    pub fn identifier(&self) -> String {
        let mut hasher = crc32fast::Hasher::new();
        for part in [
            &self.data_hash,
            &self.metadata_hash,
            &self.parent_data_hash,
            &self.parent_metadata_hash,
        ] {
            hasher.update(part.as_bytes());
            hasher.update(b"|");
        }
        hasher.finalize().to_string()
    }

    /// Hash of everything that shapes the computed rows.
    pub fn to_version(&self) -> String {
        hash_values([self.data_hash.as_str(), self.parent_data_hash.as_str()])
    }

    /// Same rows, regardless of metadata.
    pub fn is_data_compatible(&self, other: &Fingerprint) -> bool {
        self.data_hash == other.data_hash && self.parent_data_hash == other.parent_data_hash
    }
}

/// Fingerprint one definition given the fingerprints of its direct
/// dependencies. Fails if any dependency is unresolved.
pub fn fingerprint_model(
    definition: &ModelDefinition,
    resolved: &HashMap<String, Fingerprint>,
) -> StrataResult<Fingerprint> {
    let mut parent_data = Vec::with_capacity(definition.depends_on.len() * 3);
    let mut parent_metadata = Vec::with_capacity(definition.depends_on.len() * 3);
    // `depends_on` is a BTreeSet, so parents fold in name order.
    for dependency in &definition.depends_on {
        let parent = resolved
            .get(dependency)
            .ok_or_else(|| StrataError::MissingFingerprint {
                model: definition.name.clone(),
                dependency: dependency.clone(),
            })?;
        parent_data.extend([
            dependency.as_str(),
            parent.data_hash.as_str(),
            parent.parent_data_hash.as_str(),
        ]);
        parent_metadata.extend([
            dependency.as_str(),
            parent.metadata_hash.as_str(),
            parent.parent_metadata_hash.as_str(),
        ]);
    }

    Ok(Fingerprint {
        data_hash: hash_values(definition.data_fields()),
        metadata_hash: hash_values(definition.metadata_fields()),
        parent_data_hash: hash_values(parent_data),
        parent_metadata_hash: hash_values(parent_metadata),
    })
}

/// Fingerprint every definition, one topological level at a time.
///
/// Nodes of the same level are independent and hashed in parallel.
/// `external` supplies fingerprints for dependencies that have no local
/// definition (units that only exist in the target environment).
pub fn fingerprint_all(
    dag: &Dag,
    definitions: &IndexMap<String, ModelDefinition>,
    external: &HashMap<String, Fingerprint>,
) -> StrataResult<HashMap<String, Fingerprint>> {
    let mut resolved: HashMap<String, Fingerprint> = HashMap::with_capacity(dag.len());
    let mut computed: HashMap<String, Fingerprint> = HashMap::with_capacity(definitions.len());

    for level in dag.levels()? {
        for name in &level {
            if !definitions.contains_key(name) {
                if let Some(fingerprint) = external.get(name) {
                    resolved.insert(name.clone(), fingerprint.clone());
                }
            }
        }

        let batch: Vec<(String, Fingerprint)> = level
            .par_iter()
            .filter_map(|name| definitions.get(name))
            .map(|definition| {
                fingerprint_model(definition, &resolved)
                    .map(|fingerprint| (definition.name.clone(), fingerprint))
            })
            .collect::<StrataResult<Vec<_>>>()?;

        for (name, fingerprint) in batch {
            resolved.insert(name.clone(), fingerprint.clone());
            computed.insert(name, fingerprint);
        }
    }
    Ok(computed)
}
