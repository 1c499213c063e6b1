//! Transfer policy: inline vs. out-of-band.
//!
//! Small payloads ride inside the unary call. Large ones, and anything that
//! is only a handle to a stream or a local file, are staged in the
//! out-of-band store and travel as a UUID reference instead.

use crate::config::TransferConfig;

/// Payload kinds the policy distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Url,
    Uuid,
    QrCode,
    Buffer,
    Base64,
    Stream,
    File,
}

/// What the policy needs to know about a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub kind: TransferKind,
    pub size_bytes: u64,
}

impl TransferDescriptor {
    pub fn new(kind: TransferKind, size_bytes: u64) -> Self {
        Self { kind, size_bytes }
    }
}

/// Outcome of the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Inline,
    OutOfBand,
}

/// Decide how a payload travels.
pub fn decide(descriptor: &TransferDescriptor) -> TransferMode {
    match descriptor.kind {
        TransferKind::Url | TransferKind::Uuid | TransferKind::QrCode => TransferMode::Inline,
        TransferKind::Buffer | TransferKind::Base64
            if descriptor.size_bytes < TransferConfig::INLINE_THRESHOLD =>
        {
            TransferMode::Inline
        }
        TransferKind::Buffer
        | TransferKind::Base64
        | TransferKind::Stream
        | TransferKind::File => TransferMode::OutOfBand,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_references_are_always_inline() {
        for kind in [TransferKind::Url, TransferKind::Uuid, TransferKind::QrCode] {
            for size in [0, MIB, 2 * MIB, 1024 * MIB] {
                assert_eq!(
                    decide(&TransferDescriptor::new(kind, size)),
                    TransferMode::Inline,
                    "{:?} of {} bytes",
                    kind,
                    size
                );
            }
        }
    }

    #[test]
    fn test_buffers_switch_at_two_mebibytes() {
        for kind in [TransferKind::Buffer, TransferKind::Base64] {
            assert_eq!(decide(&TransferDescriptor::new(kind, 0)), TransferMode::Inline);
            assert_eq!(
                decide(&TransferDescriptor::new(kind, 2 * MIB - 1)),
                TransferMode::Inline
            );
            assert_eq!(
                decide(&TransferDescriptor::new(kind, 2 * MIB)),
                TransferMode::OutOfBand
            );
            assert_eq!(
                decide(&TransferDescriptor::new(kind, 3 * MIB)),
                TransferMode::OutOfBand
            );
        }
    }

    #[test]
    fn test_handles_always_go_out_of_band() {
        for kind in [TransferKind::Stream, TransferKind::File] {
            assert_eq!(
                decide(&TransferDescriptor::new(kind, 1)),
                TransferMode::OutOfBand
            );
        }
    }
}
