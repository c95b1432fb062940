use crate::config::Config;
use lookout_core::{GalleryError, GalleryStore};

/// Open the configured gallery.
///
/// A corrupt file is an error unless `allow_empty_gallery` is set, in which
/// case the daemon starts with an empty gallery and says so loudly. The
/// corrupt file stays on disk until the first enrollment replaces it.
pub fn open_gallery(config: &Config) -> Result<GalleryStore, GalleryError> {
    let rc = &config.recognition;
    match GalleryStore::open(&rc.gallery_path, &rc.model_version, rc.embedding_dim) {
        Err(e @ GalleryError::Corrupt { .. }) if config.allow_empty_gallery => {
            tracing::warn!(
                error = %e,
                path = %rc.gallery_path.display(),
                "gallery unusable; starting EMPTY as allowed by allow_empty_gallery"
            );
            GalleryStore::open_empty(&rc.gallery_path, &rc.model_version, rc.embedding_dim)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config(path: &Path, allow_empty_gallery: bool) -> Config {
        let mut config = Config {
            allow_empty_gallery,
            ..Config::default()
        };
        config.recognition.gallery_path = path.to_path_buf();
        config
    }

    #[test]
    fn test_corrupt_gallery_is_fatal_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        std::fs::write(&path, b"{ not a gallery").unwrap();

        assert!(matches!(
            open_gallery(&config(&path, false)),
            Err(GalleryError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_corrupt_gallery_starts_empty_when_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        std::fs::write(&path, b"{ not a gallery").unwrap();

        let store = open_gallery(&config(&path, true)).unwrap();
        assert!(store.is_empty());

        store.flush().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{ not a gallery");
    }

    #[test]
    fn test_missing_gallery_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_gallery(&config(&dir.path().join("gallery.json"), false)).unwrap();
        assert!(store.is_empty());
    }
}
