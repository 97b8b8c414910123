//! Content-type validation and charset normalization.
//!
//! The renderer is always invoked with `--encoding utf8`, so every document
//! is transcoded to UTF-8 on its way to the renderer. The source encoding is
//! resolved the way browsers do it (WHATWG labels):
//!
//! 1. a byte-order mark at the start of the body;
//! 2. the `charset` parameter of `Content-Type`;
//! 3. a `<meta charset>` or `http-equiv` declaration in the first
//!    [`SNIFF_LEN`] bytes;
//! 4. UTF-8 if those bytes are valid UTF-8, otherwise windows-1252.
//!
//! Decoding is streaming. Malformed sequences become U+FFFD rather than
//! failing the request, and multi-byte sequences split across chunks are
//! carried over to the next chunk.

use crate::error::PdfSvcError;
use bytes::Bytes;
use encoding_rs::{
    CoderResult, Decoder, Encoding, UTF_16BE, UTF_16LE, UTF_8, WINDOWS_1252, X_USER_DEFINED,
};
use futures::{Stream, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io;
use std::pin::Pin;

/// Boxed byte stream handed to the renderer.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Bytes buffered from the body to sniff an undeclared encoding.
pub const SNIFF_LEN: usize = 1024;

static RE_CHARSET_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i);\s*charset\s*=\s*(?:"([^"]*)"|([^;\s]+))"#).unwrap());

/// `charset=` inside a `<meta content>` value (already lowercased).
static RE_META_CONTENT_CHARSET: Lazy<regex::bytes::Regex> = Lazy::new(|| {
    regex::bytes::Regex::new(concat!(
        r"charset[\t\n\x0C\r ]*=[\t\n\x0C\r ]*",
        r#"(?:"([^"]*)"|'([^']*)'|([^"'\t\n\x0C\r ;][^\t\n\x0C\r ;]*))"#,
    ))
    .unwrap()
});

/// Charset of an accepted HTML upload.
///
/// `None` means the request declared no charset and the body decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DocumentCharset {
    encoding: Option<&'static Encoding>,
}

impl DocumentCharset {
    /// Validate a `Content-Type` header value.
    ///
    /// Anything but `text/html` is [`PdfSvcError::BadContentType`]; a charset
    /// with no decoder is [`PdfSvcError::UnsupportedCharset`].
    pub fn from_content_type(value: Option<&str>) -> Result<Self, PdfSvcError> {
        let bad = || PdfSvcError::BadContentType {
            content_type: value.map(str::to_string),
        };
        let value = value.ok_or_else(bad)?;
        let media_type = value.split(';').next().unwrap_or_default().trim();
        if !media_type.eq_ignore_ascii_case("text/html") {
            return Err(bad());
        }

        let Some(caps) = RE_CHARSET_PARAM.captures(value) else {
            return Ok(Self::default());
        };
        let label = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().trim())
            .unwrap_or_default();
        if label.is_empty() {
            return Ok(Self::default());
        }
        Encoding::for_label_no_replacement(label.as_bytes())
            .map(|encoding| Self {
                encoding: Some(encoding),
            })
            .ok_or_else(|| PdfSvcError::UnsupportedCharset {
                label: label.to_string(),
            })
    }

    /// WHATWG name of the declared encoding, e.g. `windows-1252`.
    pub fn name(&self) -> Option<&'static str> {
        self.encoding.map(Encoding::name)
    }

    /// Transcode `input` to UTF-8, chunk by chunk.
    pub fn decode<S>(self, input: S) -> ByteStream
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let state = Transcoder {
            input: Box::pin(input),
            decoder: self.encoding.map(Encoding::new_decoder),
            finished: false,
        };
        Box::pin(futures::stream::unfold(state, |mut state| async move {
            state.next_chunk().await.map(|item| (item, state))
        }))
    }
}

struct Transcoder {
    input: ByteStream,
    /// Unset until the head of an undeclared body has been sniffed.
    decoder: Option<Decoder>,
    finished: bool,
}

impl Transcoder {
    async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        if self.decoder.is_none() && !self.finished {
            match self.sniff().await {
                Ok(head) if !head.is_empty() => return Some(Ok(head)),
                Ok(_) => {}
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
        let decoder = self.decoder.as_mut()?;
        loop {
            if self.finished {
                return None;
            }
            match self.input.next().await {
                Some(Ok(chunk)) => {
                    let out = decode_chunk(decoder, &chunk, false);
                    if !out.is_empty() {
                        return Some(Ok(out));
                    }
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => {
                    self.finished = true;
                    let tail = decode_chunk(decoder, &[], true);
                    return (!tail.is_empty()).then(|| Ok(tail));
                }
            }
        }
    }

    /// Buffer the head of the body, pick its encoding and decode the head.
    async fn sniff(&mut self) -> io::Result<Bytes> {
        let mut head = Vec::with_capacity(SNIFF_LEN);
        let mut eof = false;
        while head.len() < SNIFF_LEN {
            match self.input.next().await {
                Some(chunk) => head.extend_from_slice(&chunk?),
                None => {
                    eof = true;
                    break;
                }
            }
        }
        let mut decoder = sniff_encoding(&head).new_decoder();
        let out = decode_chunk(&mut decoder, &head, eof);
        self.decoder = Some(decoder);
        self.finished = eof;
        Ok(out)
    }
}

fn decode_chunk(decoder: &mut Decoder, mut src: &[u8], last: bool) -> Bytes {
    let mut out = Vec::with_capacity(src.len());
    let mut buf = [0u8; 4096];
    loop {
        let (result, read, written, _) = decoder.decode_to_utf8(src, &mut buf, last);
        out.extend_from_slice(&buf[..written]);
        src = &src[read..];
        match result {
            CoderResult::InputEmpty => return Bytes::from(out),
            CoderResult::OutputFull => continue,
        }
    }
}

/// Encoding of a body that declared none, judged from its first bytes.
fn sniff_encoding(head: &[u8]) -> &'static Encoding {
    let head = &head[..head.len().min(SNIFF_LEN)];
    if let Some((encoding, _)) = Encoding::for_bom(head) {
        return encoding;
    }
    if let Some(encoding) = prescan(head) {
        return encoding;
    }
    match std::str::from_utf8(head) {
        Ok(_) => UTF_8,
        // A sequence cut off by the end of the head still counts.
        Err(e) if e.error_len().is_none() => UTF_8,
        Err(_) => WINDOWS_1252,
    }
}

fn is_space(b: u8) -> bool {
    matches!(b, b'\t' | b'\n' | b'\x0C' | b'\r' | b' ')
}

fn starts_with_ignore_case(buf: &[u8], prefix: &[u8]) -> bool {
    buf.len() >= prefix.len() && buf[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn find(buf: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    buf.get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| from + i)
}

/// Look for a `<meta>` encoding declaration, skipping comments and the
/// attributes of other tags.
fn prescan(buf: &[u8]) -> Option<&'static Encoding> {
    let mut pos = 0;
    while pos < buf.len() {
        let rest = &buf[pos..];
        if rest.starts_with(b"<!--") {
            pos = find(buf, pos + 2, b"-->")? + 3;
            continue;
        }
        if starts_with_ignore_case(rest, b"<meta")
            && rest.get(5).is_some_and(|&b| is_space(b) || b == b'/')
        {
            pos += 5;
            if let Some(encoding) = meta_encoding(buf, &mut pos) {
                return Some(encoding);
            }
        } else if rest.len() > 1
            && rest[0] == b'<'
            && (rest[1].is_ascii_alphabetic()
                || (rest[1] == b'/' && rest.get(2).is_some_and(u8::is_ascii_alphabetic)))
        {
            while pos < buf.len() && !is_space(buf[pos]) && buf[pos] != b'>' {
                pos += 1;
            }
            while next_attribute(buf, &mut pos).is_some() {}
        } else if rest.starts_with(b"<!") || rest.starts_with(b"</") || rest.starts_with(b"<?") {
            pos = find(buf, pos, b">")?;
        }
        pos += 1;
    }
    None
}

/// Attributes of one `<meta>` tag, starting after its name.
fn meta_encoding(buf: &[u8], pos: &mut usize) -> Option<&'static Encoding> {
    let mut seen: Vec<Vec<u8>> = Vec::new();
    let mut got_pragma = false;
    let mut need_pragma = None;
    let mut charset = None;

    while let Some((name, value)) = next_attribute(buf, pos) {
        if seen.contains(&name) {
            continue;
        }
        match name.as_slice() {
            b"http-equiv" => got_pragma |= value == b"content-type",
            b"content" if charset.is_none() => {
                if let Some(encoding) = content_charset(&value) {
                    charset = Some(encoding);
                    need_pragma = Some(true);
                }
            }
            b"charset" if charset.is_none() => {
                charset = Encoding::for_label_no_replacement(&value);
                need_pragma = Some(false);
            }
            _ => {}
        }
        seen.push(name);
    }

    match need_pragma {
        Some(true) if !got_pragma => None,
        None => None,
        Some(_) => charset.map(|encoding| {
            if encoding == UTF_16BE || encoding == UTF_16LE {
                UTF_8
            } else if encoding == X_USER_DEFINED {
                WINDOWS_1252
            } else {
                encoding
            }
        }),
    }
}

fn content_charset(value: &[u8]) -> Option<&'static Encoding> {
    let caps = RE_META_CONTENT_CHARSET.captures(value)?;
    let label = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3))?;
    Encoding::for_label_no_replacement(label.as_bytes())
}

/// Read one attribute as `(name, value)`, both lowercased. `None` at the end
/// of the tag or of the buffer.
fn next_attribute(buf: &[u8], pos: &mut usize) -> Option<(Vec<u8>, Vec<u8>)> {
    let at = |p: usize| buf.get(p).copied();

    while at(*pos).is_some_and(|b| is_space(b) || b == b'/') {
        *pos += 1;
    }
    if at(*pos)? == b'>' {
        return None;
    }

    let mut name = Vec::new();
    loop {
        let b = at(*pos)?;
        if b == b'=' && !name.is_empty() {
            break;
        }
        if is_space(b) {
            while at(*pos).is_some_and(is_space) {
                *pos += 1;
            }
            if at(*pos)? != b'=' {
                return Some((name, Vec::new()));
            }
            break;
        }
        if b == b'/' || b == b'>' {
            return Some((name, Vec::new()));
        }
        name.push(b.to_ascii_lowercase());
        *pos += 1;
    }

    // Past the `=`.
    *pos += 1;
    while at(*pos).is_some_and(is_space) {
        *pos += 1;
    }
    let mut value = Vec::new();
    match at(*pos)? {
        quote @ (b'"' | b'\'') => {
            *pos += 1;
            loop {
                let b = at(*pos)?;
                *pos += 1;
                if b == quote {
                    return Some((name, value));
                }
                value.push(b.to_ascii_lowercase());
            }
        }
        b'>' => Some((name, value)),
        _ => {
            while let Some(b) = at(*pos) {
                if is_space(b) || b == b'>' {
                    return Some((name, value));
                }
                value.push(b.to_ascii_lowercase());
                *pos += 1;
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    async fn transcode(charset: DocumentCharset, chunks: Vec<&'static [u8]>) -> Vec<u8> {
        let input = stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))));
        let mut out = Vec::new();
        let mut decoded = charset.decode(input);
        while let Some(chunk) = decoded.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    fn declared(label: &str) -> DocumentCharset {
        DocumentCharset::from_content_type(Some(&format!("text/html; charset={label}"))).unwrap()
    }

    #[test]
    fn content_type_variants() {
        let plain = DocumentCharset::from_content_type(Some("text/html")).unwrap();
        assert_eq!(plain.name(), None);

        let latin = DocumentCharset::from_content_type(Some("Text/HTML; Charset=ISO-8859-1"));
        assert_eq!(latin.unwrap().name(), Some("windows-1252"));

        let quoted = DocumentCharset::from_content_type(Some(r#"text/html; charset="koi8-r""#));
        assert_eq!(quoted.unwrap().name(), Some("KOI8-R"));
    }

    #[test]
    fn wrong_media_type_is_bad_request() {
        for ct in [None, Some(""), Some("application/json"), Some("text/htmlx")] {
            let err = DocumentCharset::from_content_type(ct).unwrap_err();
            assert!(matches!(err, PdfSvcError::BadContentType { .. }), "{ct:?}: {err:?}");
        }
    }

    #[test]
    fn unknown_or_replacement_charset_is_unsupported() {
        for ct in ["text/html; charset=klingon", "text/html; charset=iso-2022-kr"] {
            let err = DocumentCharset::from_content_type(Some(ct)).unwrap_err();
            assert!(matches!(err, PdfSvcError::UnsupportedCharset { .. }), "{ct}: {err:?}");
        }
    }

    #[test]
    fn sniffing_order() {
        assert_eq!(sniff_encoding(b"\xff\xfe<\x00p\x00"), UTF_16LE);
        assert_eq!(sniff_encoding(b"<meta charset=koi8-r>"), encoding_rs::KOI8_R);
        assert_eq!(sniff_encoding("<p>caf\u{e9}</p>".as_bytes()), UTF_8);
        assert_eq!(sniff_encoding(b"<p>caf\xe9</p>"), WINDOWS_1252);
        assert_eq!(sniff_encoding(b"<p>plain ascii</p>"), UTF_8);
        // Cut mid-sequence by the end of the head.
        assert_eq!(sniff_encoding(b"<p>\xe2\x82"), UTF_8);
    }

    #[test]
    fn meta_declarations() {
        let cases: [(&[u8], Option<&'static Encoding>); 10] = [
            (b"<META CHARSET='Windows-1251'>", Some(encoding_rs::WINDOWS_1251)),
            (b"<meta charset=\"iso-8859-2\"/>", Some(encoding_rs::ISO_8859_2)),
            (
                b"<meta http-equiv=Content-Type content=\"text/html; charset=shift_jis\">",
                Some(encoding_rs::SHIFT_JIS),
            ),
            (
                b"<meta content='text/html; charset=euc-kr' http-equiv='content-type'>",
                Some(encoding_rs::EUC_KR),
            ),
            // `content` only counts together with the pragma.
            (b"<meta content=\"text/html; charset=euc-kr\">", None),
            (b"<meta charset=utf-16le>", Some(UTF_8)),
            (b"<meta charset=x-user-defined>", Some(WINDOWS_1252)),
            (b"<!-- <meta charset=koi8-r> --><p>", None),
            (b"<div title='<meta charset=koi8-r>'><meta charset=gbk>", Some(encoding_rs::GBK)),
            (b"<metadata charset=koi8-r>", None),
        ];
        for (html, expected) in cases {
            assert_eq!(prescan(html), expected, "{}", String::from_utf8_lossy(html));
        }
    }

    #[test]
    fn unterminated_markup_ends_prescan() {
        assert_eq!(prescan(b"<!-- never closed <meta charset=gbk>"), None);
        assert_eq!(prescan(b"<meta charset=\"gbk"), None);
        assert_eq!(prescan(b""), None);
    }

    #[tokio::test]
    async fn latin1_is_transcoded() {
        let out = transcode(declared("latin1"), vec![b"caf\xe9".as_slice()]).await;
        assert_eq!(out, "café".as_bytes());
    }

    #[tokio::test]
    async fn meta_charset_decides_undeclared_body() {
        let html = b"<meta charset=\"windows-1251\"><p>\xcf\xf0\xe8</p>".as_slice();
        let out = transcode(DocumentCharset::default(), vec![html]).await;
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("<p>При</p>"), "{out}");
    }

    #[tokio::test]
    async fn header_charset_beats_meta() {
        let html = b"<meta charset=windows-1251><p>caf\xe9</p>".as_slice();
        let out = transcode(declared("iso-8859-1"), vec![html]).await;
        assert!(String::from_utf8(out).unwrap().ends_with("<p>café</p>"));
    }

    #[tokio::test]
    async fn undeclared_non_utf8_falls_back_to_windows_1252() {
        let out = transcode(DocumentCharset::default(), vec![b"<p>na\xefve \x80</p>".as_slice()]);
        assert_eq!(out.await, "<p>naïve €</p>".as_bytes());
    }

    #[tokio::test]
    async fn sniffing_spans_small_chunks_and_keeps_the_rest() {
        let mut chunks: Vec<&'static [u8]> = vec![b"<html><head>", b"<meta charset=koi8-r>"];
        let filler: &'static [u8] = &[b' '; 600];
        chunks.extend([filler, filler, b"<p>\xf0\xd2\xc9</p>".as_slice()]);
        let out = String::from_utf8(transcode(DocumentCharset::default(), chunks).await).unwrap();
        assert!(out.starts_with("<html><head><meta charset=koi8-r>"));
        assert!(out.ends_with("<p>При</p>"), "{out}");
        assert_eq!(out.len(), 12 + 21 + 1200 + 3 + 6 + 4);
    }

    #[tokio::test]
    async fn multibyte_sequence_split_across_chunks() {
        let euro = "€".as_bytes();
        let chunks = vec![b"1".as_slice(), &euro[..1], &euro[1..], b"!".as_slice()];
        assert_eq!(transcode(declared("utf-8"), chunks.clone()).await, "1€!".as_bytes());
        assert_eq!(transcode(DocumentCharset::default(), chunks).await, "1€!".as_bytes());
    }

    #[tokio::test]
    async fn bom_overrides_declared_charset() {
        let body = b"\xef\xbb\xbfcaf\xc3\xa9".as_slice();
        let out = transcode(declared("windows-1252"), vec![body]).await;
        assert_eq!(out, "café".as_bytes());
    }

    #[tokio::test]
    async fn truncated_input_ends_with_replacement() {
        let out = transcode(DocumentCharset::default(), vec![b"ok\xe2\x82".as_slice()]).await;
        assert_eq!(out, "ok\u{FFFD}".as_bytes());
    }

    #[tokio::test]
    async fn empty_body_stays_empty() {
        assert!(transcode(DocumentCharset::default(), vec![]).await.is_empty());
    }

    #[tokio::test]
    async fn input_errors_pass_through() {
        let input = stream::iter(vec![
            Ok(Bytes::from_static(b"<p>")),
            Err(io::Error::new(io::ErrorKind::Other, "disk")),
        ]);
        let mut decoded = declared("utf-8").decode(input);
        assert_eq!(decoded.next().await.unwrap().unwrap(), "<p>");
        assert!(decoded.next().await.unwrap().is_err());
        assert!(decoded.next().await.is_none());

        let input = stream::iter(vec![
            Ok(Bytes::from_static(b"<p>")),
            Err(io::Error::new(io::ErrorKind::Other, "disk")),
        ]);
        let mut decoded = DocumentCharset::default().decode(input);
        assert!(decoded.next().await.unwrap().is_err());
        assert!(decoded.next().await.is_none());
    }
}
