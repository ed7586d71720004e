//! sFlow v5 datagram rewriter.
//!
//! An sFlow v5 datagram is an XDR-encoded tree of length-prefixed
//! structures (reference: <https://sflow.org/SFLOW-DATAGRAM5.txt>):
//!
//! ```text
//! datagram := version(4) | agent_addr_type(4) | agent_block(16|28)
//!           | sample_count(4) | sample...
//! sample   := data_format(4) | length(4) | body[length]
//! record   := data_format(4) | length(4) | body[length]
//! ```
//!
//! The rewriter walks that tree copying it from the cursor's source buffer
//! to its destination buffer. Flow samples (enterprise 0, format 1)
//! containing raw-packet-header records (enterprise 0, format 1) whose
//! captured frame is a VXLAN-in-UDP encapsulation get their outer
//! Ethernet/IP/UDP/VXLAN prefix removed; the record length, frame length
//! and header length fields are then patched in place in the destination.
//! Any other sample or record is carried through byte-for-byte using its
//! declared length.
//!
//! Length fields precede the bodies they describe, so the rewriters copy
//! them as placeholders, process the children, and back-patch through
//! absolute destination offsets once the rewritten size is known.

use thiserror::Error;
use tracing::{debug, warn};

use crate::cursor::{Cursor, CursorError};

/// The only datagram version this rewriter understands.
const SFLOW_VERSION: u32 = 5;

/// Agent address type discriminators.
const AGENT_ADDR_IPV4: u32 = 1;
const AGENT_ADDR_IPV6: u32 = 2;

/// Agent address block sizes: address + sub-agent id + sequence number +
/// uptime.
const AGENT_BLOCK_IPV4_LEN: usize = 16;
const AGENT_BLOCK_IPV6_LEN: usize = 28;

/// Enterprise number of the standard sFlow structures.
const ENTERPRISE_STANDARD: u32 = 0;
/// Flow-sample format within enterprise 0.
const FORMAT_FLOW_SAMPLE: u32 = 1;
/// Raw-packet-header record format within enterprise 0.
const FORMAT_RAW_PACKET_HEADER: u32 = 1;
/// Header protocol value for an Ethernet frame capture.
const HEADER_PROTO_ETHERNET: u32 = 1;

/// Fixed flow-sample fields between the sample header and the record
/// count: sequence number, source id, sampling rate, pool, drops, input
/// and output interface. Seven 32-bit words.
const FLOW_SAMPLE_FIXED_LEN: usize = 28;

const ETHERTYPE_8021Q: u16 = 0x8100;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;

const IP_PROTO_UDP: u8 = 0x11;

/// UDP destination port assigned to VXLAN (RFC 7348).
pub const VXLAN_PORT: u16 = 4789;
/// Length of the VXLAN header in bytes.
const VXLAN_HDR_LEN: usize = 8;

/// A condition that aborts the rewrite of the current datagram.
///
/// There is no finer-grained recovery: the caller forwards the original
/// datagram verbatim. Unsupported samples, records and encapsulations are
/// not errors; they are passed through in place and their siblings keep
/// processing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RewriteError {
    #[error("unsupported datagram version {0}")]
    UnsupportedVersion(u32),

    #[error("unsupported agent address type {0}")]
    UnsupportedAddressType(u32),

    #[error("declared length shorter than bytes already consumed")]
    LengthUnderflow,

    #[error(transparent)]
    Cursor(#[from] CursorError),
}

/// Rewrites the datagram bound to `cur` and returns the bytes to forward.
///
/// On success this is the rewritten copy; on any fatal condition the
/// original datagram is returned unchanged, so a malformed or unsupported
/// datagram is still delivered rather than dropped.
pub fn rewrite(cur: &mut Cursor) -> &[u8] {
    match process_datagram(cur) {
        Ok(()) => cur.processed_bytes(),
        Err(err) => {
            warn!(error = %err, "failed to rewrite datagram, forwarding original");
            cur.source_bytes()
        }
    }
}

/// Processes one whole datagram: validates the envelope, copies the agent
/// block, and runs the sample rewriter for each declared sample. Trailing
/// bytes beyond the declared samples are ignored and not copied.
pub fn process_datagram(cur: &mut Cursor) -> Result<(), RewriteError> {
    let version = cur.copy_u32()?;
    if version != SFLOW_VERSION {
        return Err(RewriteError::UnsupportedVersion(version));
    }

    match cur.copy_u32()? {
        AGENT_ADDR_IPV4 => cur.copy_bytes(AGENT_BLOCK_IPV4_LEN)?,
        AGENT_ADDR_IPV6 => cur.copy_bytes(AGENT_BLOCK_IPV6_LEN)?,
        other => return Err(RewriteError::UnsupportedAddressType(other)),
    }

    let sample_count = cur.copy_u32()?;
    for _ in 0..sample_count {
        process_sample(cur)?;
    }

    Ok(())
}

/// Processes one sample starting at its data-format word.
///
/// Samples other than a standard flow sample are carried through verbatim.
/// For flow samples the declared length is copied as a placeholder and
/// patched once every record has been rewritten.
fn process_sample(cur: &mut Cursor) -> Result<(), RewriteError> {
    let (enterprise, format) = cur.copy_data_format()?;
    let declared_len = cur.copy_u32()? as usize;
    let src_body = cur.src_offset();
    let dst_body = cur.dst_offset();

    if enterprise != ENTERPRISE_STANDARD || format != FORMAT_FLOW_SAMPLE {
        debug!(enterprise, format, "passing through unsupported sample");
        cur.copy_bytes_at(declared_len, src_body, dst_body)?;
        return Ok(());
    }

    cur.copy_bytes(FLOW_SAMPLE_FIXED_LEN)?;

    let record_count = cur.copy_u32()?;
    for _ in 0..record_count {
        process_record(cur)?;
    }

    // The length placeholder sits in the 4 bytes just before the body.
    let new_len = (cur.dst_offset() - dst_body) as u32;
    cur.write_u32_at(new_len, dst_body - 4)?;

    Ok(())
}

/// Processes one record starting at its data-format word.
///
/// Only raw-packet-header records capturing an Ethernet frame that wraps
/// UDP-to-4789 traffic are rewritten; everything else is carried through
/// verbatim. Rewriting drops the captured frame's outer prefix up to and
/// including the VXLAN header, re-aligns the remainder, and patches the
/// three affected length fields.
fn process_record(cur: &mut Cursor) -> Result<(), RewriteError> {
    let (enterprise, format) = cur.copy_data_format()?;
    let declared_len = cur.copy_u32()? as usize;
    let src_body = cur.src_offset();
    let dst_body = cur.dst_offset();

    if enterprise != ENTERPRISE_STANDARD || format != FORMAT_RAW_PACKET_HEADER {
        debug!(enterprise, format, "passing through unsupported record");
        cur.copy_bytes_at(declared_len, src_body, dst_body)?;
        return Ok(());
    }

    let header_protocol = cur.copy_u32()?;
    if header_protocol != HEADER_PROTO_ETHERNET {
        debug!(header_protocol, "passing through non-ethernet capture");
        cur.copy_bytes_at(declared_len, src_body, dst_body)?;
        return Ok(());
    }

    let old_frame_len = cur.copy_u32()?;
    cur.copy_bytes(4)?; // payload-removed, carried unchanged
    let old_header_len = cur.copy_u32()?;

    // Walk the captured frame on the source side only; nothing is copied
    // until the start of the inner frame is known.
    cur.skip(12)?; // destination MAC + source MAC

    let ip_proto = loop {
        match cur.read_u16()? {
            // A VLAN tag inserts a 2-byte TCI before the real ethertype;
            // stacked tags re-enter the loop.
            ETHERTYPE_8021Q => cur.skip(2)?,
            ETHERTYPE_IPV4 => {
                let ihl = (cur.read_u8()? & 0x0F) as usize;
                cur.skip(8)?;
                let proto = cur.read_u8()?;
                // 10 header bytes are consumed so far (version/IHL through
                // protocol); the rest of the header is IHL words long.
                let remainder = (ihl * 4)
                    .checked_sub(10)
                    .ok_or(RewriteError::LengthUnderflow)?;
                cur.skip(remainder)?;
                break proto;
            }
            ETHERTYPE_IPV6 => {
                // Fixed 40-byte header assumed; extension headers between
                // IPv6 and UDP are not handled.
                cur.skip(6)?;
                let proto = cur.read_u8()?;
                cur.skip(33)?;
                break proto;
            }
            other => {
                debug!(ethertype = other, "passing through unsupported ethertype");
                cur.copy_bytes_at(declared_len, src_body, dst_body)?;
                return Ok(());
            }
        }
    };

    if ip_proto != IP_PROTO_UDP {
        debug!(ip_proto, "passing through non-UDP capture");
        cur.copy_bytes_at(declared_len, src_body, dst_body)?;
        return Ok(());
    }

    cur.skip(2)?; // UDP source port
    let udp_dst_port = cur.read_u16()?;
    if udp_dst_port != VXLAN_PORT {
        debug!(udp_dst_port, "passing through non-VXLAN capture");
        cur.copy_bytes_at(declared_len, src_body, dst_body)?;
        return Ok(());
    }
    cur.skip(4 + VXLAN_HDR_LEN)?; // UDP length + checksum, VXLAN header

    // Everything left of the record body is the inner frame.
    let consumed = cur.src_offset() - src_body;
    let inner_len = declared_len
        .checked_sub(consumed)
        .ok_or(RewriteError::LengthUnderflow)?;
    let dst_header = cur.dst_offset();
    cur.copy_bytes(inner_len)?;

    // The captured header is the record's only variable-length field and
    // XDR requires it to end on a 4-byte boundary.
    let mut header_len = cur.dst_offset() - dst_header;
    let rem = header_len % 4;
    if rem != 0 {
        cur.pad(4 - rem)?;
        header_len += 4 - rem;
    }

    cur.write_u32_at((cur.dst_offset() - dst_body) as u32, dst_body - 4)?;

    // The frame shrank by exactly the stripped prefix; the on-wire frame
    // length field must shrink with it.
    let stripped = old_header_len
        .checked_sub(header_len as u32)
        .ok_or(RewriteError::LengthUnderflow)?;
    let new_frame_len = old_frame_len
        .checked_sub(stripped)
        .ok_or(RewriteError::LengthUnderflow)?;
    cur.write_u32_at(new_frame_len, dst_body + 4)?;
    cur.write_u32_at(header_len as u32, dst_body + 12)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor_with(data: &[u8]) -> Cursor {
        let mut cur = Cursor::new(1500);
        cur.source_mut()[..data.len()].copy_from_slice(data);
        cur.reset(data.len());
        cur
    }

    #[test]
    fn rejects_non_v5_version() {
        let mut data = Vec::new();
        data.extend_from_slice(&4u32.to_be_bytes());
        data.extend_from_slice(&[0; 20]);

        let mut cur = cursor_with(&data);
        assert_eq!(
            process_datagram(&mut cur),
            Err(RewriteError::UnsupportedVersion(4))
        );
    }

    #[test]
    fn rejects_unknown_agent_address_type() {
        let mut data = Vec::new();
        data.extend_from_slice(&5u32.to_be_bytes());
        data.extend_from_slice(&3u32.to_be_bytes());
        data.extend_from_slice(&[0; 28]);

        let mut cur = cursor_with(&data);
        assert_eq!(
            process_datagram(&mut cur),
            Err(RewriteError::UnsupportedAddressType(3))
        );
    }

    #[test]
    fn empty_datagram_is_a_source_overrun() {
        let mut cur = cursor_with(&[]);
        assert!(matches!(
            process_datagram(&mut cur),
            Err(RewriteError::Cursor(CursorError::SourceOverrun { .. }))
        ));
    }

    #[test]
    fn trap_returns_source_on_failure() {
        let data = [0, 0, 0, 4, 0xDE, 0xAD];
        let mut cur = cursor_with(&data);
        assert_eq!(rewrite(&mut cur), &data);
    }
}
