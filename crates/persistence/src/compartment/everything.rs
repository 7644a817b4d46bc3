//! Worklist traversal behind `$everything`.

use std::collections::{HashSet, VecDeque};

use tracing::trace;

use crate::error::StorageResult;
use crate::types::StoredResource;

/// Collects an owner, its compartment members and what they reference.
///
/// The owner sits at depth 0 and the members at depth 1. Each resource
/// whose depth is below `max_depth` has its references fetched through
/// `fetch_references` and queued one level deeper. Every resource appears
/// once, the owner first, then in discovery order.
pub fn collect<F>(
    owner: StoredResource,
    members: Vec<StoredResource>,
    max_depth: usize,
    mut fetch_references: F,
) -> StorageResult<Vec<StoredResource>>
where
    F: FnMut(&StoredResource) -> StorageResult<Vec<StoredResource>>,
{
    let mut visited: HashSet<(String, String)> = HashSet::new();
    let mut queue: VecDeque<(StoredResource, usize)> = VecDeque::new();
    let mut collected = Vec::new();

    visited.insert(key(&owner));
    queue.push_back((owner, 0));
    for member in members {
        if visited.insert(key(&member)) {
            queue.push_back((member, 1));
        }
    }

    while let Some((resource, depth)) = queue.pop_front() {
        if depth < max_depth {
            for referenced in fetch_references(&resource)? {
                if referenced.is_deleted() {
                    continue;
                }
                if visited.insert(key(&referenced)) {
                    trace!(
                        from = %resource.url(),
                        to = %referenced.url(),
                        depth = depth + 1,
                        "Following reference"
                    );
                    queue.push_back((referenced, depth + 1));
                }
            }
        }
        collected.push(resource);
    }
    Ok(collected)
}

fn key(resource: &StoredResource) -> (String, String) {
    (resource.resource_type().to_string(), resource.id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::FhirVersion;
    use serde_json::json;

    fn stored(resource_type: &str, id: &str) -> StoredResource {
        StoredResource::new(
            resource_type,
            id,
            FhirVersion::R4,
            json!({"resourceType": resource_type, "id": id}),
        )
    }

    #[test]
    fn test_owner_first_and_no_duplicates() {
        let owner = stored("Patient", "p1");
        let members = vec![stored("Observation", "o1"), stored("Encounter", "e1")];

        let result = collect(owner, members, 2, |r| {
            Ok(match r.url().as_str() {
                "Patient/p1" => vec![stored("Practitioner", "dr")],
                "Observation/o1" => vec![stored("Patient", "p1"), stored("Practitioner", "dr")],
                "Encounter/e1" => vec![stored("Organization", "org")],
                _ => Vec::new(),
            })
        })
        .unwrap();

        let urls: Vec<String> = result.iter().map(|r| r.url()).collect();
        assert_eq!(
            urls,
            vec![
                "Patient/p1",
                "Observation/o1",
                "Encounter/e1",
                "Practitioner/dr",
                "Organization/org"
            ]
        );
    }

    #[test]
    fn test_depth_limit() {
        let owner = stored("Patient", "p1");
        let members = vec![stored("Observation", "o1")];

        let mut fetched = Vec::new();
        let result = collect(owner, members, 1, |r| {
            fetched.push(r.url());
            Ok(vec![stored("Practitioner", "dr")])
        })
        .unwrap();

        assert_eq!(fetched, vec!["Patient/p1"]);
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn test_cycles_terminate() {
        let owner = stored("Patient", "a");
        let result = collect(owner, Vec::new(), 10, |r| {
            Ok(match r.id() {
                "a" => vec![stored("Patient", "b")],
                _ => vec![stored("Patient", "a")],
            })
        })
        .unwrap();
        assert_eq!(result.len(), 2);
    }
}
