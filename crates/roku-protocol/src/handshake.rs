//! Session-start handshake with the debug target.
//!
//! Both sides exchange a fixed 64-bit magic number, then the target
//! reports its protocol version triple. Protocol 3.0+ appends a packet
//! length and a platform revision timestamp; the length is verified (any
//! surplus is forward-compatibility padding, as with updates).

use std::io::{Read, Write};

use crate::codec::{WireReader, WireWriter};
use crate::error::ProtocolError;
use crate::version::{FeatureSet, ProtocolVersion};

/// TCP port of the target's debug control service.
pub const DEBUGGER_PORT: u16 = 8081;

/// 64-bit little-endian magic, ASCII `bsdebug\0`.
pub const DEBUGGER_MAGIC: u64 = 0x0067_7562_6564_7362;

/// Outcome of a successful handshake.
#[derive(Debug, Clone, Copy)]
pub struct Handshake {
    pub version: ProtocolVersion,
    pub features: FeatureSet,
}

/// Run the client side of the handshake over a connected control socket.
///
/// Errors are fatal to the session: magic mismatch, invalid or
/// unsupported version, or a packet-length overrun.
pub fn perform<R: Read, W: Write>(
    reader: &mut WireReader<R>,
    writer: &mut WireWriter<W>,
) -> Result<Handshake, ProtocolError> {
    writer.write_u64(DEBUGGER_MAGIC)?;
    writer.flush()?;

    let magic = reader.read_u64()?;
    if magic != DEBUGGER_MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }

    let major = reader.read_u32()?;
    let minor = reader.read_u32()?;
    let patch = reader.read_u32()?;
    let mut version = ProtocolVersion::new(major, minor, patch);

    if major >= 3 {
        reader.reset_byte_count();
        let declared = reader.read_u32()?;
        let revision = reader.read_i64()?;
        version = version.with_platform_revision(revision);

        let consumed = reader.bytes_read();
        if consumed < u64::from(declared) {
            reader.skip(u64::from(declared) - consumed)?;
        } else if consumed > u64::from(declared) {
            return Err(ProtocolError::PacketLengthMismatch { declared, consumed });
        }
    }

    version.check_supported()?;
    tracing::debug!(%version, revision = ?version.platform_revision(), "handshake complete");

    Ok(Handshake { version, features: FeatureSet::from_version(version) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::ProtocolFeature;
    use std::io::Cursor;

    fn target_hello(version: (u32, u32, u32), v3_tail: Option<(u32, i64, usize)>) -> Vec<u8> {
        let mut w = WireWriter::new(Vec::new());
        w.write_u64(DEBUGGER_MAGIC).unwrap();
        w.write_u32(version.0).unwrap();
        w.write_u32(version.1).unwrap();
        w.write_u32(version.2).unwrap();
        if let Some((packet_length, revision, padding)) = v3_tail {
            w.write_u32(packet_length).unwrap();
            w.write_i64(revision).unwrap();
            for _ in 0..padding {
                w.write_u8(0).unwrap();
            }
        }
        w.into_inner()
    }

    fn run(hello: Vec<u8>) -> Result<Handshake, ProtocolError> {
        let mut reader = WireReader::new(Cursor::new(hello));
        let mut writer = WireWriter::new(Vec::new());
        let result = perform(&mut reader, &mut writer);
        // The client always leads with its own magic.
        let sent = writer.into_inner();
        assert_eq!(&sent[..8], &DEBUGGER_MAGIC.to_le_bytes());
        result
    }

    #[test]
    fn v3_0_0_happy_path() {
        // packet-length 16: length field + revision + 4 padding bytes.
        let hello = target_hello((3, 0, 0), Some((16, 1_650_000_000_000, 4)));
        let handshake = run(hello).unwrap();
        assert_eq!(handshake.version, ProtocolVersion::new(3, 0, 0));
        assert_eq!(handshake.version.platform_revision(), Some(1_650_000_000_000));
        assert!(handshake.features.has(ProtocolFeature::UpdatesHavePacketLength));
        assert!(handshake.features.has(ProtocolFeature::ExecuteReturnsErrors));
        assert!(!handshake.features.has(ProtocolFeature::ConditionalBreakpoints));
    }

    #[test]
    fn v3_exact_packet_length() {
        let hello = target_hello((3, 1, 1), Some((12, 1_700_000_000_000, 0)));
        let handshake = run(hello).unwrap();
        assert_eq!(handshake.version, ProtocolVersion::new(3, 1, 1));
    }

    #[test]
    fn v2_has_no_revision_tail() {
        let hello = target_hello((2, 0, 0), None);
        let handshake = run(hello).unwrap();
        assert_eq!(handshake.version, ProtocolVersion::new(2, 0, 0));
        assert_eq!(handshake.version.platform_revision(), None);
        assert!(!handshake.features.has(ProtocolFeature::UpdatesHavePacketLength));
    }

    #[test]
    fn magic_mismatch_aborts() {
        let mut hello = target_hello((3, 0, 0), Some((12, 0, 0)));
        hello[0] ^= 0xFF;
        assert!(matches!(run(hello), Err(ProtocolError::BadMagic(_))));
    }

    #[test]
    fn unsupported_major_aborts() {
        let hello = target_hello((4, 0, 0), Some((12, 0, 0)));
        assert!(matches!(run(hello), Err(ProtocolError::UnsupportedVersion(_))));
    }

    #[test]
    fn packet_length_overrun_aborts() {
        // Declared shorter than the mandatory revision field.
        let hello = target_hello((3, 0, 0), Some((8, 0, 0)));
        assert!(matches!(run(hello), Err(ProtocolError::PacketLengthMismatch { .. })));
    }

    #[test]
    fn truncated_handshake_is_eof() {
        let hello = target_hello((3, 0, 0), None);
        assert!(matches!(run(hello), Err(ProtocolError::UnexpectedEof)));
    }
}
