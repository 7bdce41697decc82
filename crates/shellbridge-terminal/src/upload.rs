//! Process-wide upload callback registry.
//!
//! The FUSE driver that exposes each session as a write-only file at
//! `/<uuid>` is out of scope; this module is the boundary it would call
//! into. A session registers a callback under its own UUID for the
//! lifetime of the sandbox; any writer that completes a full, in-budget
//! write to that path invokes the callback with the assembled bytes.

use dashmap::DashMap;
use std::sync::OnceLock;
use tokio::sync::mpsc;

use shellbridge_core::config::UPLOAD_MAX_BYTES;

pub type UploadSender = mpsc::UnboundedSender<Vec<u8>>;

fn registry() -> &'static DashMap<String, UploadSender> {
    static REGISTRY: OnceLock<DashMap<String, UploadSender>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Extract the upload UUID from a FUSE path: must be `/` followed by a
/// single path component with no further slashes.
pub fn path_to_session_id(path: &str) -> Option<&str> {
    let rest = path.strip_prefix('/')?;
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    Some(rest)
}

/// Register `uuid` for the lifetime of the returned guard; uploads
/// delivered to that path arrive on `receiver`.
pub struct Registration {
    uuid: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        registry().remove(&self.uuid);
    }
}

pub fn register(uuid: String) -> (Registration, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    registry().insert(uuid.clone(), tx);
    (Registration { uuid }, rx)
}

/// Whether `uuid` currently has a live registration (the FUSE driver's
/// `getattr`/`_valid_path` check).
pub fn is_registered(uuid: &str) -> bool {
    registry().contains_key(uuid)
}

/// Deliver `data` to the session registered under `uuid`. Returns false if
/// the size budget is exceeded or no session is registered; the FUSE write
/// handler maps that to `-EFBIG`/`-EIO` respectively.
pub fn deliver(uuid: &str, data: Vec<u8>) -> bool {
    if data.len() > UPLOAD_MAX_BYTES {
        return false;
    }
    match registry().get(uuid) {
        Some(tx) => tx.send(data).is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_to_session_id_accepts_single_component() {
        assert_eq!(path_to_session_id("/abc123"), Some("abc123"));
    }

    #[test]
    fn path_to_session_id_rejects_root_and_nested() {
        assert_eq!(path_to_session_id("/"), None);
        assert_eq!(path_to_session_id("/a/b"), None);
        assert_eq!(path_to_session_id("no-leading-slash"), None);
    }

    #[test]
    fn register_then_deliver_reaches_receiver() {
        let (_guard, mut rx) = register("test-uuid-1".to_string());
        assert!(is_registered("test-uuid-1"));
        assert!(deliver("test-uuid-1", b"hello".to_vec()));
        assert_eq!(rx.try_recv().unwrap(), b"hello");
    }

    #[test]
    fn deliver_rejects_oversized_payload() {
        let (_guard, _rx) = register("test-uuid-2".to_string());
        let oversized = vec![0u8; UPLOAD_MAX_BYTES + 1];
        assert!(!deliver("test-uuid-2", oversized));
    }

    #[test]
    fn deliver_fails_for_unknown_uuid() {
        assert!(!deliver("does-not-exist", b"x".to_vec()));
    }

    #[test]
    fn dropping_registration_unregisters() {
        let (guard, _rx) = register("test-uuid-3".to_string());
        drop(guard);
        assert!(!is_registered("test-uuid-3"));
    }
}
