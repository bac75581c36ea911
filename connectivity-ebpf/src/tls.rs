//! TLS ClientHello parsing
//!
//! Locates the Server Name Indication inside the first TLS record of a
//! payload. The walk is bounded at every step so the verifier can prove
//! termination; anything that does not look like a ClientHello carrying a
//! host name yields `None`.

use aya_ebpf::programs::SkBuffContext;

/// TLS record content type for handshake messages.
const CONTENT_TYPE_HANDSHAKE: u8 = 22;

/// Handshake message type for ClientHello.
const HANDSHAKE_CLIENT_HELLO: u8 = 1;

/// Extension number of server_name (RFC 6066).
const EXTENSION_SERVER_NAME: u16 = 0;

/// server_name list entry type for a DNS host name.
const NAME_TYPE_HOST_NAME: u8 = 0;

/// Upper bound on extensions examined per ClientHello.
const MAX_EXTENSIONS: usize = 32;

/// Location of the host name inside the packet.
pub struct ServerName {
    /// Byte offset of the name from the start of the frame.
    pub offset: usize,
    /// Length of the name in octets.
    pub len: usize,
}

#[inline(always)]
fn load_u8(ctx: &SkBuffContext, offset: usize) -> Option<u8> {
    ctx.load::<u8>(offset).ok()
}

#[inline(always)]
fn load_u16be(ctx: &SkBuffContext, offset: usize) -> Option<u16> {
    let bytes: [u8; 2] = ctx.load(offset).ok()?;
    Some(u16::from_be_bytes(bytes))
}

/// Walk the TLS record starting at `payload` and return the position of the
/// SNI host name, if the record is a ClientHello that carries one.
///
/// `end` is one past the last payload byte according to the IP total length;
/// no field beyond it is trusted.
pub fn find_server_name(
    ctx: &SkBuffContext,
    payload: usize,
    end: usize,
) -> Option<ServerName> {
    // TLS record header (5 bytes) + handshake header (4 bytes)
    if payload + 9 > end {
        return None;
    }
    if load_u8(ctx, payload)? != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    if load_u8(ctx, payload + 5)? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }

    // ClientHello body: version(2) random(32) follow the handshake header.
    let mut cursor = payload + 9 + 2 + 32;

    // session_id
    let session_id_len = load_u8(ctx, cursor)? as usize;
    cursor += 1 + session_id_len;

    // cipher_suites
    let cipher_suites_len = load_u16be(ctx, cursor)? as usize;
    cursor += 2 + cipher_suites_len;

    // compression_methods
    let compression_len = load_u8(ctx, cursor)? as usize;
    cursor += 1 + compression_len;

    // extensions
    let extensions_len = load_u16be(ctx, cursor)? as usize;
    cursor += 2;
    let mut extensions_end = cursor + extensions_len;
    if extensions_end > end {
        extensions_end = end;
    }

    for _ in 0..MAX_EXTENSIONS {
        if cursor + 4 > extensions_end {
            return None;
        }
        let extension_type = load_u16be(ctx, cursor)?;
        let extension_len = load_u16be(ctx, cursor + 2)? as usize;
        cursor += 4;

        if extension_type == EXTENSION_SERVER_NAME {
            // server_name_list: list_len(2) name_type(1) name_len(2) name
            if extension_len < 5 {
                return None;
            }
            if load_u8(ctx, cursor + 2)? != NAME_TYPE_HOST_NAME {
                return None;
            }
            let name_len = load_u16be(ctx, cursor + 3)? as usize;
            let name_offset = cursor + 5;
            if name_len == 0 || name_offset + name_len > extensions_end {
                return None;
            }
            return Some(ServerName {
                offset: name_offset,
                len: name_len,
            });
        }

        cursor += extension_len;
    }

    None
}
