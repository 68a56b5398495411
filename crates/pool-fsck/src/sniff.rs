/// Magic prefixes of formats that do not compress further.
const SIGNATURES: &[(&[u8], &str)] = &[
    (b"\x1f\x8b", "application/gzip"),
    (b"\x28\xb5\x2f\xfd", "application/zstd"),
    (b"\xfd7zXZ\x00", "application/x-xz"),
    (b"BZh", "application/x-bzip2"),
    (b"7z\xbc\xaf\x27\x1c", "application/x-7z-compressed"),
    (b"PK\x03\x04", "application/zip"),
    (b"%PDF-", "application/pdf"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF8", "image/gif"),
    (b"OggS", "audio/ogg"),
    (b"ID3", "audio/mpeg"),
    (b"\x1aE\xdf\xa3", "video/webm"),
];

/// Best guess at the content type of a chunk from its first bytes.
pub fn sniff_content_type(head: &[u8]) -> &'static str {
    if let Some((_, mime)) = SIGNATURES.iter().find(|(magic, _)| head.starts_with(magic)) {
        return *mime;
    }
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return "video/mp4";
    }
    if head.is_empty() {
        return "application/x-empty";
    }
    match std::str::from_utf8(head) {
        Ok(text) if text.chars().all(|c| !c.is_control() || c.is_whitespace()) => "text/plain",
        // A multi-byte character cut at the end of the window.
        Err(e) if e.error_len().is_none() && e.valid_up_to() + 4 > head.len() => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_signatures() {
        assert_eq!(sniff_content_type(b"\x1f\x8b\x08\x00"), "application/gzip");
        assert_eq!(sniff_content_type(b"\x89PNG\r\n\x1a\n...."), "image/png");
        assert_eq!(sniff_content_type(b"\0\0\0\x18ftypmp42"), "video/mp4");
    }

    #[test]
    fn falls_back_to_text_or_binary() {
        assert_eq!(sniff_content_type(b"hello world\n"), "text/plain");
        assert_eq!(sniff_content_type("caf\u{e9}".as_bytes()), "text/plain");
        assert_eq!(sniff_content_type(&[0, 159, 146, 150]), "application/octet-stream");
        assert_eq!(sniff_content_type(b""), "application/x-empty");
    }
}
