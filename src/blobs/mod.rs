use std::collections::HashMap;

use parking_lot::RwLock;
use rand::Rng;

pub const OBJECT_URL_SCHEME: &str = "blob:";

#[derive(Debug, Clone)]
pub struct Blob {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// Short-lived handles to in-memory bytes, addressed as `blob:<origin>/<id>`.
///
/// A handle stays dereferenceable until it is revoked.
pub trait BlobStore: Send + Sync {
    fn create_object_url(&self, data: Vec<u8>, content_type: &str) -> String;

    /// Releases a handle. Revoking an unknown handle is a no-op.
    fn revoke_object_url(&self, url: &str);

    fn get(&self, url: &str) -> Option<Blob>;
}

pub fn is_object_url(url: &str) -> bool {
    url.starts_with(OBJECT_URL_SCHEME)
}

// Blob storage for compressed images, lives until revoked
pub struct BlobRegistry {
    origin: String,
    blobs: RwLock<HashMap<String, Blob>>,
}

impl BlobRegistry {
    pub fn new(origin: &str) -> Self {
        Self {
            origin: origin.trim_end_matches('/').to_string(),
            blobs: RwLock::new(HashMap::new()),
        }
    }

    /// Looks a blob up by the trailing id of its handle.
    pub fn get_by_id(&self, id: &str) -> Option<Blob> {
        self.get(&self.object_url_for(id))
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    fn object_url_for(&self, id: &str) -> String {
        format!("{}{}/{}", OBJECT_URL_SCHEME, self.origin, id)
    }
}

impl BlobStore for BlobRegistry {
    fn create_object_url(&self, data: Vec<u8>, content_type: &str) -> String {
        let mut blobs = self.blobs.write();
        let url = loop {
            let candidate = self.object_url_for(&new_blob_id());
            if !blobs.contains_key(&candidate) {
                break candidate;
            }
        };
        blobs.insert(
            url.clone(),
            Blob {
                data,
                content_type: content_type.to_string(),
            },
        );
        url
    }

    fn revoke_object_url(&self, url: &str) {
        self.blobs.write().remove(url);
    }

    fn get(&self, url: &str) -> Option<Blob> {
        self.blobs.read().get(url).cloned()
    }
}

// Random v4-style identifier, the same shape browsers hand out
fn new_blob_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}-4{}-{}-{}", &hex[0..8], &hex[8..12], &hex[13..16], &hex[16..20], &hex[20..32])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_get_revoke() {
        let registry = BlobRegistry::new("http://localhost:8000/");
        let url = registry.create_object_url(vec![1, 2, 3], "image/jpeg");

        assert!(url.starts_with("blob:http://localhost:8000/"));
        assert!(is_object_url(&url));

        let blob = registry.get(&url).unwrap();
        assert_eq!(blob.data, vec![1, 2, 3]);
        assert_eq!(blob.content_type, "image/jpeg");

        let id = url.rsplit('/').next().unwrap();
        assert!(registry.get_by_id(id).is_some());

        registry.revoke_object_url(&url);
        assert!(registry.get(&url).is_none());
        assert!(registry.is_empty());

        // Second revoke is harmless
        registry.revoke_object_url(&url);
    }

    #[test]
    fn test_handles_are_unique() {
        let registry = BlobRegistry::new("http://localhost:8000");
        let a = registry.create_object_url(vec![0], "image/jpeg");
        let b = registry.create_object_url(vec![0], "image/jpeg");

        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_blob_id_shape() {
        let id = new_blob_id();
        let parts: Vec<&str> = id.split('-').collect();

        assert_eq!(parts.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![8, 4, 4, 4, 12]);
        assert!(parts[2].starts_with('4'));
    }
}
