//! Channel reordering and extraction.
//!
//! These routines run on the hot path: the permutations never allocate and
//! work frame-by-frame on interleaved samples.

use crate::format::{ChannelMask, MAX_CHANNELS, WG4_CHANNEL_ORDER};

/// Result of [`check_channel_extraction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelExtraction {
    /// For each output channel, the source channel index to copy from.
    pub selection: [usize; MAX_CHANNELS],
    /// Physical layout of the extracted channels plus decoration bits.
    pub layout: ChannelMask,
    /// Number of extracted channels.
    pub channels: usize,
    /// Whether the selection is not the identity over the full source.
    pub needed: bool,
}

/// Computes the permutation mapping channels in `order_in` to `order_out`,
/// restricted to the channels present in `mask`.
///
/// `table[i]` is the output slot of input channel `i`. The second return is
/// true iff any `table[i] != i` for the first `channels` entries.
pub fn check_channel_reorder(
    order_in: Option<&[ChannelMask]>,
    order_out: Option<&[ChannelMask]>,
    mask: ChannelMask,
    channels: usize,
) -> ([usize; MAX_CHANNELS], bool) {
    let order_in = order_in.unwrap_or(&WG4_CHANNEL_ORDER);
    let order_out = order_out.unwrap_or(&WG4_CHANNEL_ORDER);

    let mut table = [0usize; MAX_CHANNELS];
    if channels > MAX_CHANNELS {
        return (table, false);
    }

    let mut j = 0;
    for &chan in order_in {
        if !mask.intersects(chan) {
            continue;
        }
        // Output slot = number of mask-present channels preceding this one in
        // the output order.
        let mut slot = 0;
        for &out in order_out {
            if out == chan {
                break;
            }
            if mask.intersects(out) {
                slot += 1;
            }
        }
        if j < MAX_CHANNELS {
            table[j] = slot;
            j += 1;
        }
    }

    let reorder_needed = table.iter().take(channels).enumerate().any(|(i, &t)| t != i);
    (table, reorder_needed)
}

/// Applies a channel permutation in place, frame by frame.
///
/// `bits_per_sample` must be one of 8, 16, 24 or 32.
pub fn channel_reorder(buf: &mut [u8], channels: usize, table: &[usize], bits_per_sample: u32) {
    debug_assert!(matches!(bits_per_sample, 8 | 16 | 24 | 32));
    debug_assert!(channels <= MAX_CHANNELS);

    let bytes = (bits_per_sample / 8) as usize;
    let frame_size = channels * bytes;
    if frame_size == 0 {
        return;
    }

    let mut tmp = [0u8; MAX_CHANNELS * 4];
    for frame in buf.chunks_exact_mut(frame_size) {
        for (j, &target) in table.iter().take(channels).enumerate() {
            tmp[target * bytes..target * bytes + bytes]
                .copy_from_slice(&frame[j * bytes..j * bytes + bytes]);
        }
        frame.copy_from_slice(&tmp[..frame_size]);
    }
}

/// Copies a channel subset from `src` to `dst`, frame by frame.
///
/// Does not work in place. `bits_per_sample` must be one of 8, 16, 24, 32
/// or 64.
pub fn channel_extract(
    dst: &mut [u8],
    dst_channels: usize,
    src: &[u8],
    src_channels: usize,
    sample_count: usize,
    selection: &[usize],
    bits_per_sample: u32,
) {
    debug_assert!(matches!(bits_per_sample, 8 | 16 | 24 | 32 | 64));
    let bytes = (bits_per_sample / 8) as usize;

    for i in 0..sample_count {
        let src_frame = &src[i * src_channels * bytes..];
        let dst_frame = &mut dst[i * dst_channels * bytes..];
        for (j, &sel) in selection.iter().take(dst_channels).enumerate() {
            dst_frame[j * bytes..j * bytes + bytes]
                .copy_from_slice(&src_frame[sel * bytes..sel * bytes + bytes]);
        }
    }
}

/// Chooses which source channels to keep when mapping an arbitrary source
/// order onto the canonical WG4 order.
///
/// Detects the dual-mono special case (two center channels) and rewrites it
/// as left/right with the `DUALMONO` decoration. Unknown and duplicated
/// channels are dropped.
pub fn check_channel_extraction(
    order_src: &[ChannelMask],
    channels: usize,
) -> ChannelExtraction {
    const DUAL_MONO: [ChannelMask; 2] = [ChannelMask::LEFT, ChannelMask::RIGHT];

    let mut layout = ChannelMask::empty();
    let mut order_src = &order_src[..channels.min(order_src.len())];

    if channels == 2
        && order_src.first() == Some(&ChannelMask::CENTER)
        && order_src.get(1) == Some(&ChannelMask::CENTER)
    {
        layout = layout.with(ChannelMask::DUALMONO);
        order_src = &DUAL_MONO;
    }

    // Keep the first occurrence of every channel known to the WG4 order.
    let mut index = [0usize; MAX_CHANNELS];
    let mut out = 0;
    for (i, &chan) in order_src.iter().enumerate() {
        if chan.is_empty() || layout.contains(chan) {
            continue;
        }
        if WG4_CHANNEL_ORDER.contains(&chan) {
            debug_assert!(out < MAX_CHANNELS);
            index[out] = i;
            out += 1;
            layout = layout.with(chan);
        }
    }

    // Emit the kept channels in WG4 order.
    let mut selection = [0usize; MAX_CHANNELS];
    let mut j = 0;
    for &dst in &WG4_CHANNEL_ORDER {
        for &k in index.iter().take(out) {
            if order_src[k] == dst {
                selection[j] = k;
                j += 1;
                break;
            }
        }
    }

    let needed = selection.iter().take(out).enumerate().any(|(i, &s)| s != i)
        || out != channels;
    ChannelExtraction {
        selection,
        layout,
        channels: out,
        needed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ChannelMask as M;

    #[test]
    fn identity_order_needs_no_reorder() {
        let (table, needed) =
            check_channel_reorder(None, None, M::STEREO, 2);
        assert!(!needed);
        assert_eq!(&table[..2], &[0, 1]);
    }

    #[test]
    fn swapped_stereo_is_detected() {
        let order_in = [M::RIGHT, M::LEFT];
        let (table, needed) = check_channel_reorder(Some(&order_in), None, M::STEREO, 2);
        assert!(needed);
        assert_eq!(&table[..2], &[1, 0]);
    }

    #[test]
    fn reorder_applies_permutation_s16() {
        let order_in = [M::RIGHT, M::LEFT];
        let (table, needed) = check_channel_reorder(Some(&order_in), None, M::STEREO, 2);
        assert!(needed);

        // Two frames of interleaved s16: (R=1, L=2), (R=3, L=4).
        let mut buf = Vec::new();
        for v in [1i16, 2, 3, 4] {
            buf.extend_from_slice(&v.to_ne_bytes());
        }
        channel_reorder(&mut buf, 2, &table[..2], 16);

        let out: Vec<i16> = buf
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(out, vec![2, 1, 4, 3]);
    }

    #[test]
    fn reorder_roundtrip_is_identity() {
        // 5.1 in a scrambled order vs WG4.
        let order_in = [
            M::CENTER,
            M::LEFT,
            M::RIGHT,
            M::REARLEFT,
            M::REARRIGHT,
            M::LFE,
        ];
        let mask = M::STEREO
            .with(M::CENTER)
            .with(M::REARLEFT)
            .with(M::REARRIGHT)
            .with(M::LFE);
        let (fwd, needed) = check_channel_reorder(Some(&order_in), None, mask, 6);
        assert!(needed);
        let (rev, _) = check_channel_reorder(None, Some(&order_in), mask, 6);

        let mut buf: Vec<u8> = (0u8..6 * 4 * 3).collect(); // 3 frames of 6 x 32-bit
        let original = buf.clone();
        channel_reorder(&mut buf, 6, &fwd[..6], 32);
        assert_ne!(buf, original);
        channel_reorder(&mut buf, 6, &rev[..6], 32);
        assert_eq!(buf, original);
    }

    #[test]
    fn extraction_detects_dual_mono() {
        let order = [M::CENTER, M::CENTER];
        let extraction = check_channel_extraction(&order, 2);
        assert!(extraction.layout.contains(M::DUALMONO));
        assert!(extraction.layout.contains(M::LEFT));
        assert!(extraction.layout.contains(M::RIGHT));
        assert_eq!(extraction.channels, 2);
    }

    #[test]
    fn extraction_drops_unknown_channels() {
        let unknown = ChannelMask::empty();
        let order = [M::LEFT, unknown, M::RIGHT];
        let extraction = check_channel_extraction(&order, 3);
        assert_eq!(extraction.channels, 2);
        assert!(extraction.needed);
        assert_eq!(&extraction.selection[..2], &[0, 2]);
    }

    #[test]
    fn extract_copies_selected_channels() {
        // 2 samples of 3 channels u8, keep channels 0 and 2.
        let src = [10u8, 20, 30, 11, 21, 31];
        let mut dst = [0u8; 4];
        channel_extract(&mut dst, 2, &src, 3, 2, &[0, 2], 8);
        assert_eq!(dst, [10, 30, 11, 31]);
    }
}
