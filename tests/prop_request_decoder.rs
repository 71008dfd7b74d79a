// Properties of request path decoding and cache key derivation

use image_edge_cache::request::Target;
use image_edge_cache::{RequestDecoder, TransformOptions};
use proptest::prelude::*;
use std::path::Path;

const BASE: &str = "/srv/files";

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// A four-segment path with a bare filename is a local target stored at
    /// `<base>/<storage>/<filename>` with transforms disabled.
    #[test]
    fn prop_local_target_maps_to_storage_path(
        app in "[a-z]{1,8}",
        storage in "[a-z0-9_-]{1,12}",
        filename in "[A-Za-z0-9_-]{1,16}\\.(jpg|png|gif)",
    ) {
        let decoder = RequestDecoder::new(BASE);
        let req = decoder.decode(&format!("/{}/image/{}/{}", app, storage, filename));

        prop_assert!(!req.transform_enabled());
        prop_assert_eq!(&req.target, &Target::Local { filename: filename.clone() });
        let key = req.cache_key.expect("plain segments always yield a key");
        prop_assert_eq!(key.path().to_path_buf(), Path::new(BASE).join(&storage).join(&filename));
    }

    /// Remote identifiers keep the options segment and key on the URL basename.
    #[test]
    fn prop_remote_target_with_options(
        host in "[a-z]{3,10}\\.(com|net|org)",
        dir in "[a-z]{1,6}",
        filename in "[a-z0-9]{1,10}\\.(jpg|png)",
        width in 1u32..4000,
    ) {
        let decoder = RequestDecoder::new(BASE);
        let encoded = format!("http%3A%2F%2F{}%2F{}%2F{}", host, dir, filename);
        let option = format!("resize{}", width);
        let req = decoder.decode(&format!("/demo/image/upload/{}/{}", option, encoded));

        prop_assert_eq!(req.options.as_ref(), Some(&TransformOptions::new(option)));
        let remote = req.remote().expect("fully qualified URL is remote");
        prop_assert_eq!(remote.url(), format!("http://{}/{}/{}", host, dir, filename));
        prop_assert_eq!(&remote.hostname, &host);
        let key = req.cache_key.as_ref().expect("remote basename yields a key");
        prop_assert_eq!(key.filename(), filename.as_str());
        prop_assert_eq!(key.storage(), "upload");
    }

    /// Distinct (storage, filename) pairs never share a cache file.
    #[test]
    fn prop_cache_keys_are_collision_free(
        storage1 in "[a-z]{1,6}",
        storage2 in "[a-z]{1,6}",
        file1 in "[a-z]{1,6}\\.jpg",
        file2 in "[a-z]{1,6}\\.jpg",
    ) {
        prop_assume!((&storage1, &file1) != (&storage2, &file2));

        let decoder = RequestDecoder::new(BASE);
        let key1 = decoder.decode(&format!("/a/b/{}/{}", storage1, file1)).cache_key.unwrap();
        let key2 = decoder.decode(&format!("/a/b/{}/{}", storage2, file2)).cache_key.unwrap();
        prop_assert_ne!(key1.path(), key2.path());
    }

    /// Decoding never panics, and any key it produces stays one directory
    /// below the base.
    #[test]
    fn prop_decode_total_and_contained(raw in "[a-zA-Z0-9%./_:-]{0,60}") {
        let decoder = RequestDecoder::new(BASE);
        let req = decoder.decode(&raw);

        if let Some(key) = &req.cache_key {
            prop_assert_eq!(key.dir().parent(), Some(Path::new(BASE)));
        }
        if req.segment_count <= 4 {
            prop_assert!(!req.transform_enabled());
        }
    }
}
