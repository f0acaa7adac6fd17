//! Torrent descriptor and magnet link parsing.
//!
//! Metadata extraction uses bencode-rs for descriptors and magnet-url for
//! magnet URIs. A small encoder covers the bencode we emit ourselves.

pub mod bencode;
pub mod encode;
pub mod magnet;
pub mod types;

pub use bencode::BencodeParser;
pub use encode::{BencodeValue, encode_torrent_file};
pub use magnet::MagnetParser;
pub use types::{FileEntry, MagnetLink, TorrentMetadata};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::InfoHash;

    fn info_dictionary(files: Option<Vec<(&str, i64)>>, length: i64, pieces: usize) -> Vec<u8> {
        let mut info = BencodeValue::dictionary()
            .with("name", "show")
            .with("piece length", 16_384i64)
            .with("pieces", vec![7u8; pieces * 20]);
        info = match files {
            Some(files) => {
                let entries: Vec<BencodeValue> = files
                    .into_iter()
                    .map(|(path, length)| {
                        BencodeValue::dictionary()
                            .with("length", length)
                            .with("path", vec![BencodeValue::from(path)])
                    })
                    .collect();
                info.with("files", entries)
            }
            None => info.with("length", length),
        };
        info.encode()
    }

    #[test]
    fn test_single_file_descriptor() {
        let info = info_dictionary(None, 40_000, 3);
        let torrent = encode_torrent_file(&info, &["http://tracker.test/announce".to_string()]);

        let metadata = BencodeParser::parse_torrent(&torrent).unwrap();
        assert_eq!(metadata.name, "show");
        assert_eq!(metadata.piece_length, 16_384);
        assert_eq!(metadata.total_length, 40_000);
        assert_eq!(metadata.piece_count(), 3);
        assert_eq!(metadata.files.len(), 1);
        assert_eq!(metadata.files[0].pieces, 0..3);
        assert_eq!(metadata.announce_urls, vec!["http://tracker.test/announce"]);
        assert_eq!(metadata.info_hash, BencodeParser::info_hash(&info));
        assert_eq!(metadata.piece_size(crate::torrent::PieceIndex::new(2)), 40_000 - 2 * 16_384);
    }

    #[test]
    fn test_multi_file_descriptor_layout() {
        let info = info_dictionary(Some(vec![("a.srt", 1_000), ("b.mkv", 50_000)]), 0, 4);
        let torrent = encode_torrent_file(&info, &[]);

        let metadata = BencodeParser::parse_torrent(&torrent).unwrap();
        assert_eq!(metadata.files.len(), 2);
        assert_eq!(metadata.files[1].path, vec!["show", "b.mkv"]);
        assert_eq!(metadata.files[1].offset, 1_000);
        assert_eq!(metadata.files[1].pieces, 0..4);
        assert!(metadata.announce_urls.is_empty());
    }

    #[test]
    fn test_info_hash_ignores_surrounding_keys() {
        let info = info_dictionary(None, 100, 1);
        let plain = encode_torrent_file(&info, &[]);
        let with_trackers = encode_torrent_file(
            &info,
            &["http://a/announce".to_string(), "http://b/announce".to_string()],
        );

        let a = BencodeParser::parse_torrent(&plain).unwrap();
        let b = BencodeParser::parse_torrent(&with_trackers).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
        assert_eq!(b.announce_urls.len(), 2);
    }

    #[test]
    fn test_piece_count_mismatch_rejected() {
        let info = info_dictionary(None, 100_000, 2);
        let torrent = encode_torrent_file(&info, &[]);
        assert!(BencodeParser::parse_torrent(&torrent).is_err());
    }

    #[test]
    fn test_invalid_torrent_data() {
        assert!(BencodeParser::parse_torrent(b"invalid torrent data").is_err());
        assert!(BencodeParser::parse_torrent(b"d8:announce3:urle").is_err());
    }

    #[test]
    fn test_find_dictionary_end_skips_nested_strings() {
        let data = b"d3:keyl1:de4:infoi5ee trailing";
        assert_eq!(BencodeParser::find_bencode_dictionary_end(data).unwrap(), 21);
        assert!(BencodeParser::find_bencode_dictionary_end(b"l1:ae").is_err());
        assert!(BencodeParser::find_bencode_dictionary_end(b"d3:key").is_err());
    }

    #[test]
    fn test_magnet_link_parsing() {
        let magnet = MagnetParser::parse_magnet_link(
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Test%20Torrent&tr=http://tracker.example.com/announce",
        )
        .unwrap();

        assert_eq!(
            magnet.info_hash,
            "0123456789abcdef0123456789abcdef01234567".parse::<InfoHash>().unwrap()
        );
        assert_eq!(magnet.display_name.as_deref(), Some("Test Torrent"));
        assert_eq!(magnet.trackers, vec!["http://tracker.example.com/announce"]);
    }

    #[test]
    fn test_magnet_base32_hash() {
        // Base32 of twenty zero bytes.
        let magnet =
            MagnetParser::parse_magnet_link("magnet:?xt=urn:btih:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA")
                .unwrap();
        assert_eq!(magnet.info_hash, InfoHash::new([0u8; 20]));
    }

    #[test]
    fn test_invalid_magnet_link() {
        assert!(MagnetParser::parse_magnet_link("invalid://not-a-magnet").is_err());
        assert!(MagnetParser::parse_magnet_link("magnet:?xt=urn:btih:abcd").is_err());
    }

    #[test]
    fn test_magnet_uri_round_trip() {
        let hash = InfoHash::new([0xab; 20]);
        let uri = MagnetParser::to_magnet_uri(hash, "My Show", &["http://t/announce".to_string()]);
        let parsed = MagnetParser::parse_magnet_link(&uri).unwrap();
        assert_eq!(parsed.info_hash, hash);
        assert_eq!(parsed.display_name.as_deref(), Some("My Show"));
    }
}
