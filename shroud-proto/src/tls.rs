/// TLS record inspection: classify records, detect handshake completion and
/// session tickets, extract or rewrite SNI. No TLS library needed — the
/// proxy never decrypts anything, it only reads plaintext framing.
///
/// TLS record format:
///   ContentType(1) | Version(2) | Length(2) | Fragment...
///
/// Handshake:
///   HandshakeType(1) | Length(3) | ClientHello...
///
/// ClientHello:
///   Version(2) | Random(32) | SessionID(var) | CipherSuites(var) |
///   CompressionMethods(var) | Extensions(var)
///
/// SNI extension (type 0x0000):
///   ServerNameList length(2) | NameType(1) | HostName length(2) | HostName...
use std::fmt;
use std::io;

// ── Constants ────────────────────────────────────────────────────────

pub const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;

pub const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;
pub const CONTENT_ALERT: u8 = 21;
pub const CONTENT_HANDSHAKE: u8 = 22;
pub const CONTENT_APPLICATION_DATA: u8 = 23;
pub const CONTENT_HEARTBEAT: u8 = 24;

pub const HANDSHAKE_CLIENT_HELLO: u8 = 1;
pub const HANDSHAKE_SERVER_HELLO: u8 = 2;
pub const HANDSHAKE_NEW_SESSION_TICKET: u8 = 4;
pub const HANDSHAKE_CERTIFICATE: u8 = 11;
pub const HANDSHAKE_FINISHED: u8 = 20;

const EXT_SERVER_NAME: u16 = 0;
const SNI_HOST_NAME: u8 = 0;

// ── Errors ───────────────────────────────────────────────────────────

/// Why a buffer could not be parsed as the record we were looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsParseError {
    /// Fewer bytes than a length prefix promised (including the record
    /// header itself).
    Short,
    /// Record content type is not Handshake.
    NotHandshake,
    /// Handshake subtype is not ClientHello.
    NotClientHello,
    /// A length prefix inside the extensions block overruns the buffer.
    TruncatedExtensions,
    /// Extensions present but no server_name extension among them.
    NoSniExtension,
    /// server_name extension present but no host_name entry in it.
    NoHostname,
}

impl fmt::Display for TlsParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TlsParseError::Short => "record truncated",
            TlsParseError::NotHandshake => "not a handshake record",
            TlsParseError::NotClientHello => "not a ClientHello",
            TlsParseError::TruncatedExtensions => "truncated extensions",
            TlsParseError::NoSniExtension => "no server_name extension",
            TlsParseError::NoHostname => "no host_name entry",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for TlsParseError {}

impl From<TlsParseError> for io::Error {
    fn from(e: TlsParseError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

// ── Record header ────────────────────────────────────────────────────

/// The 5-byte prefix of every TLS record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: u8,
    pub version: u16,
    pub length: u16,
}

pub fn parse_record_header(buf: &[u8]) -> Result<RecordHeader, TlsParseError> {
    if buf.len() < RECORD_HEADER_LEN {
        return Err(TlsParseError::Short);
    }
    Ok(RecordHeader {
        content_type: buf[0],
        version: u16::from_be_bytes([buf[1], buf[2]]),
        length: u16::from_be_bytes([buf[3], buf[4]]),
    })
}

/// True iff the buffer starts an ApplicationData record or a Finished
/// handshake message — either one means the handshake is done from our
/// point of view.
pub fn is_handshake_complete(buf: &[u8]) -> bool {
    match buf.first() {
        Some(&CONTENT_APPLICATION_DATA) => true,
        Some(&CONTENT_HANDSHAKE) => buf.len() > 5 && buf[5] == HANDSHAKE_FINISHED,
        _ => false,
    }
}

/// True iff the buffer starts a NewSessionTicket handshake message.
pub fn is_session_ticket(buf: &[u8]) -> bool {
    buf.len() >= 6 && buf[0] == CONTENT_HANDSHAKE && buf[5] == HANDSHAKE_NEW_SESSION_TICKET
}

// ── SNI extraction ───────────────────────────────────────────────────

/// Byte offsets of every length prefix enclosing the host_name entry,
/// collected while walking a ClientHello. `rewrite_sni` patches them all.
struct SniLocation {
    handshake_len_off: usize,
    extensions_len_off: usize,
    ext_len_off: usize,
    list_len_off: usize,
    name_len_off: usize,
    name_start: usize,
    name_end: usize,
}

/// Extract the SNI hostname from a complete ClientHello record.
///
/// Strict: every length prefix must fit inside the buffer, starting with the
/// record length itself. A prefix that would read past the end is an error,
/// never followed.
pub fn extract_sni(buf: &[u8]) -> Result<String, TlsParseError> {
    let loc = locate_sni(buf)?;
    let name = &buf[loc.name_start..loc.name_end];
    String::from_utf8(name.to_vec()).map_err(|_| TlsParseError::NoHostname)
}

/// Replace the host_name entry of a ClientHello with `hostname`, fixing up
/// all six enclosing length prefixes. The input buffer is not modified.
pub fn rewrite_sni(buf: &[u8], hostname: &str) -> Result<Vec<u8>, TlsParseError> {
    if hostname.is_empty() || hostname.len() > 255 {
        return Err(TlsParseError::NoHostname);
    }
    let loc = locate_sni(buf)?;
    let old_len = (loc.name_end - loc.name_start) as isize;
    let delta = hostname.len() as isize - old_len;

    let mut out = Vec::with_capacity(buf.len() + hostname.len());
    out.extend_from_slice(&buf[..loc.name_start]);
    out.extend_from_slice(hostname.as_bytes());
    out.extend_from_slice(&buf[loc.name_end..]);

    // All six prefixes sit before the splice point, so their offsets hold.
    patch_u16(&mut out, 3, delta); // record length
    patch_u24(&mut out, loc.handshake_len_off, delta);
    patch_u16(&mut out, loc.extensions_len_off, delta);
    patch_u16(&mut out, loc.ext_len_off, delta);
    patch_u16(&mut out, loc.list_len_off, delta);
    patch_u16(&mut out, loc.name_len_off, delta);
    Ok(out)
}

fn patch_u16(buf: &mut [u8], off: usize, delta: isize) {
    let v = u16::from_be_bytes([buf[off], buf[off + 1]]) as isize + delta;
    buf[off..off + 2].copy_from_slice(&(v as u16).to_be_bytes());
}

fn patch_u24(buf: &mut [u8], off: usize, delta: isize) {
    let old = ((buf[off] as u32) << 16) | ((buf[off + 1] as u32) << 8) | buf[off + 2] as u32;
    let v = (old as isize + delta) as u32;
    buf[off] = (v >> 16) as u8;
    buf[off + 1] = (v >> 8) as u8;
    buf[off + 2] = v as u8;
}

fn locate_sni(buf: &[u8]) -> Result<SniLocation, TlsParseError> {
    let header = parse_record_header(buf)?;
    if header.content_type != CONTENT_HANDSHAKE {
        return Err(TlsParseError::NotHandshake);
    }
    let record_len = header.length as usize;
    if buf.len() < RECORD_HEADER_LEN + record_len {
        return Err(TlsParseError::Short);
    }
    let record = &buf[RECORD_HEADER_LEN..RECORD_HEADER_LEN + record_len];
    if record.len() < HANDSHAKE_HEADER_LEN {
        return Err(TlsParseError::Short);
    }
    if record[0] != HANDSHAKE_CLIENT_HELLO {
        return Err(TlsParseError::NotClientHello);
    }
    let hs_len = ((record[1] as usize) << 16) | ((record[2] as usize) << 8) | record[3] as usize;
    if record.len() < HANDSHAKE_HEADER_LEN + hs_len {
        return Err(TlsParseError::Short);
    }
    // ClientHello body, offsets below are relative to `ch`.
    let ch_start = RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN;
    let ch = &record[HANDSHAKE_HEADER_LEN..HANDSHAKE_HEADER_LEN + hs_len];

    // version(2) + random(32)
    if ch.len() < 35 {
        return Err(TlsParseError::Short);
    }
    let mut pos = 34;

    let session_id_len = ch[pos] as usize;
    pos += 1;
    if pos + session_id_len + 2 > ch.len() {
        return Err(TlsParseError::Short);
    }
    pos += session_id_len;

    let cipher_suites_len = u16::from_be_bytes([ch[pos], ch[pos + 1]]) as usize;
    pos += 2;
    if pos + cipher_suites_len + 1 > ch.len() {
        return Err(TlsParseError::Short);
    }
    pos += cipher_suites_len;

    let compression_len = ch[pos] as usize;
    pos += 1;
    if pos + compression_len + 2 > ch.len() {
        return Err(TlsParseError::Short);
    }
    pos += compression_len;

    let extensions_len_off = ch_start + pos;
    let extensions_len = u16::from_be_bytes([ch[pos], ch[pos + 1]]) as usize;
    pos += 2;
    if pos + extensions_len > ch.len() {
        return Err(TlsParseError::TruncatedExtensions);
    }
    let ext_end = pos + extensions_len;

    while pos + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([ch[pos], ch[pos + 1]]);
        let ext_len_off = ch_start + pos + 2;
        let ext_len = u16::from_be_bytes([ch[pos + 2], ch[pos + 3]]) as usize;
        pos += 4;
        if pos + ext_len > ext_end {
            return Err(TlsParseError::TruncatedExtensions);
        }
        if ext_type == EXT_SERVER_NAME {
            return locate_host_name(ch, pos, ext_len, ch_start, extensions_len_off, ext_len_off);
        }
        pos += ext_len;
    }

    Err(TlsParseError::NoSniExtension)
}

fn locate_host_name(
    ch: &[u8],
    ext_start: usize,
    ext_len: usize,
    ch_start: usize,
    extensions_len_off: usize,
    ext_len_off: usize,
) -> Result<SniLocation, TlsParseError> {
    let data = &ch[ext_start..ext_start + ext_len];
    if data.len() < 2 {
        return Err(TlsParseError::TruncatedExtensions);
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if 2 + list_len > data.len() {
        return Err(TlsParseError::TruncatedExtensions);
    }
    let mut pos = 2;
    let end = 2 + list_len;

    while pos + 3 <= end {
        let name_type = data[pos];
        let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        if pos + 3 + name_len > end {
            return Err(TlsParseError::TruncatedExtensions);
        }
        if name_type == SNI_HOST_NAME {
            let abs = |off: usize| ch_start + ext_start + off;
            return Ok(SniLocation {
                handshake_len_off: RECORD_HEADER_LEN + 1,
                extensions_len_off,
                ext_len_off,
                list_len_off: abs(0),
                name_len_off: abs(pos + 1),
                name_start: abs(pos + 3),
                name_end: abs(pos + 3 + name_len),
            });
        }
        pos += 3 + name_len;
    }

    Err(TlsParseError::NoHostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal TLS ClientHello carrying the given SNI.
    fn build_client_hello(hostname: &str) -> Vec<u8> {
        build_client_hello_padded(hostname, 0)
    }

    /// Same, with a padding extension (type 21) of `pad` zero bytes appended
    /// so tests can hit exact wire sizes.
    fn build_client_hello_padded(hostname: &str, pad: usize) -> Vec<u8> {
        let host_bytes = hostname.as_bytes();

        // SNI extension payload
        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&((3 + host_bytes.len()) as u16).to_be_bytes()); // list len
        sni_ext.push(0x00); // host_name
        sni_ext.extend_from_slice(&(host_bytes.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(host_bytes);

        // Extensions block
        let mut extensions = Vec::new();
        extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
        extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext);
        if pad > 0 {
            extensions.extend_from_slice(&21u16.to_be_bytes()); // padding
            extensions.extend_from_slice(&(pad as u16).to_be_bytes());
            extensions.extend_from_slice(&vec![0u8; pad]);
        }

        // ClientHello body
        let mut ch_body = Vec::new();
        ch_body.extend_from_slice(&[0x03, 0x03]); // TLS 1.2
        ch_body.extend_from_slice(&[0u8; 32]); // random
        ch_body.push(32); // session id
        ch_body.extend_from_slice(&[0u8; 32]);
        ch_body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites length
        ch_body.extend_from_slice(&[0x13, 0x01]);
        ch_body.push(1); // compression methods length
        ch_body.push(0); // null compression
        ch_body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        ch_body.extend_from_slice(&extensions);

        // Handshake header
        let mut handshake = Vec::new();
        handshake.push(HANDSHAKE_CLIENT_HELLO);
        let hs_len = ch_body.len();
        handshake.push((hs_len >> 16) as u8);
        handshake.push((hs_len >> 8) as u8);
        handshake.push(hs_len as u8);
        handshake.extend_from_slice(&ch_body);

        // TLS record header
        let mut record = Vec::new();
        record.push(CONTENT_HANDSHAKE);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);

        record
    }

    #[test]
    fn extracts_sni_from_client_hello() {
        let ch = build_client_hello("example.com");
        assert_eq!(extract_sni(&ch).unwrap(), "example.com");
    }

    #[test]
    fn extracts_sni_from_browser_sized_hello() {
        // A browser ClientHello is 517 bytes on the wire; pad up to that.
        let bare = build_client_hello("example.com").len();
        let ch = build_client_hello_padded("example.com", 517 - bare - 4);
        assert_eq!(ch.len(), 517);
        assert_eq!(extract_sni(&ch).unwrap(), "example.com");
    }

    #[test]
    fn rejects_http_bytes() {
        let http = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(extract_sni(http), Err(TlsParseError::NotHandshake));
    }

    #[test]
    fn rejects_short_buffer() {
        assert_eq!(extract_sni(&[0x16, 0x03, 0x01]), Err(TlsParseError::Short));
        assert_eq!(parse_record_header(&[0x16]), Err(TlsParseError::Short));
    }

    #[test]
    fn rejects_non_client_hello_handshake() {
        let mut ch = build_client_hello("example.com");
        ch[5] = HANDSHAKE_SERVER_HELLO;
        assert_eq!(extract_sni(&ch), Err(TlsParseError::NotClientHello));
    }

    #[test]
    fn rejects_hello_without_extensions() {
        // Truncate the extensions block length to zero.
        let ch = build_client_hello("example.com");
        let ext_block_start = ch.len() - {
            // extensions = 4 (sni ext header) + 2 (list len) + 3 + "example.com".len()
            4 + 2 + 3 + 11
        };
        let mut bare = ch[..ext_block_start].to_vec();
        let cut = ch.len() - ext_block_start;
        // fix record, handshake and extensions lengths for the shorter body
        bare[3..5].copy_from_slice(&(u16::from_be_bytes([ch[3], ch[4]]) - cut as u16).to_be_bytes());
        let hs_len = (((ch[6] as usize) << 16) | ((ch[7] as usize) << 8) | ch[8] as usize) - cut;
        bare[6] = (hs_len >> 16) as u8;
        bare[7] = (hs_len >> 8) as u8;
        bare[8] = hs_len as u8;
        let ext_len_off = bare.len() - 2;
        bare[ext_len_off..].copy_from_slice(&0u16.to_be_bytes());
        assert_eq!(extract_sni(&bare), Err(TlsParseError::NoSniExtension));
    }

    #[test]
    fn any_truncation_errors_never_panics() {
        let ch = build_client_hello("example.com");
        for len in 0..ch.len() {
            let res = extract_sni(&ch[..len]);
            assert!(res.is_err(), "truncation to {} bytes yielded {:?}", len, res);
        }
    }

    #[test]
    fn record_header_roundtrip() {
        let ch = build_client_hello("example.com");
        let header = parse_record_header(&ch).unwrap();
        assert_eq!(header.content_type, CONTENT_HANDSHAKE);
        assert_eq!(header.version, 0x0301);
        assert_eq!(header.length as usize, ch.len() - RECORD_HEADER_LEN);
    }

    #[test]
    fn handshake_complete_predicate() {
        assert!(is_handshake_complete(&[CONTENT_APPLICATION_DATA]));
        assert!(is_handshake_complete(&[23, 3, 3, 0, 16, 0xaa]));
        assert!(is_handshake_complete(&[22, 3, 3, 0, 40, HANDSHAKE_FINISHED]));
        assert!(!is_handshake_complete(&[22, 3, 3, 0, 40])); // no subtype byte
        assert!(!is_handshake_complete(&[22, 3, 3, 0, 40, HANDSHAKE_SERVER_HELLO]));
        assert!(!is_handshake_complete(&[CONTENT_CHANGE_CIPHER_SPEC, 3, 3, 0, 1, 1]));
        assert!(!is_handshake_complete(&[]));
    }

    #[test]
    fn session_ticket_predicate() {
        // First six bytes per the NewSessionTicket shape: 22 03 03 00 C2 04
        let mut buf = vec![0u8; 200];
        buf[..6].copy_from_slice(&[0x16, 0x03, 0x03, 0x00, 0xC2, 0x04]);
        assert!(is_session_ticket(&buf));
        assert!(!is_session_ticket(&buf[..5]));
        assert!(!is_session_ticket(&[22, 3, 3, 0, 40, HANDSHAKE_FINISHED]));
        assert!(!is_session_ticket(&[23, 3, 3, 0, 1, 4]));
    }

    #[test]
    fn rewrite_sni_to_longer_name() {
        let ch = build_client_hello("example.com");
        let out = rewrite_sni(&ch, "decoy.example.org").unwrap();
        assert_eq!(extract_sni(&out).unwrap(), "decoy.example.org");
        let header = parse_record_header(&out).unwrap();
        assert_eq!(header.length as usize, out.len() - RECORD_HEADER_LEN);
    }

    #[test]
    fn rewrite_sni_to_shorter_name() {
        let ch = build_client_hello("a-rather-long-hostname.example.com");
        let out = rewrite_sni(&ch, "x.io").unwrap();
        assert_eq!(extract_sni(&out).unwrap(), "x.io");
        let header = parse_record_header(&out).unwrap();
        assert_eq!(header.length as usize, out.len() - RECORD_HEADER_LEN);
    }

    #[test]
    fn rewrite_sni_rejects_bad_input() {
        let ch = build_client_hello("example.com");
        assert!(rewrite_sni(&ch, "").is_err());
        assert!(rewrite_sni(b"not tls at all", "decoy.net").is_err());
    }
}
