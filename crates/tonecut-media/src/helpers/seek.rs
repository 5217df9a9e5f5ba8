// crates/tonecut-media/src/helpers/seek.rs
//
// Seek helper wrapping ffmpeg's avformat seek with consistent Windows EPERM
// soft-fail behaviour.
//
// Background:
//   On Windows, `avformat_seek_file` returns EPERM ("Operation not permitted")
//   in certain conditions — notably when called on a freshly-opened context
//   with max_ts=0, or on some container formats that don't support random
//   access. Rather than duplicating the guard + log pattern at every call
//   site, all seeks route through here. The caller chooses how to handle
//   failure via the return value — hard error vs soft-fail is a policy
//   decision at the call site, not here.

use ffmpeg_the_third as ffmpeg;

/// Seek `ictx` to `target_us` microseconds from the start of the file.
///
/// Returns `true` if the seek succeeded (or was skipped because the target is
/// 0). Returns `false` if the seek failed — the demuxer will read from
/// wherever it currently is, and the caller's timestamp gate will discard
/// pre-roll AUs correctly.
///
/// Always logs a warning on failure so seek issues are visible without
/// aborting the run.
///
/// # Why backward seek (`..=seek_ts`)
/// A forward seek (`seek_ts..`) lands on the sync sample AT OR AFTER
/// `target_us`. When the target falls between sync samples, the AUs between
/// the target and that forward sync sample would be absent from the stream —
/// the trim would start late. A backward seek lands on the sync sample BEFORE
/// `target_us`; the pre-roll AUs are discarded by the caller's gate, so the
/// first kept AU is still correctly at the range start.
///
/// # Why skip at 0
/// `avformat_seek_file(max_ts=0)` returns EPERM on Windows when called on a
/// freshly-opened context. Since the demuxer starts at position 0 by default,
/// skipping the seek entirely is both correct and avoids the error.
pub fn seek_to_us(
    ictx: &mut ffmpeg::format::context::Input,
    target_us: i64,
    label: &str,   // caller description for log messages e.g. "trim"
) -> bool {
    if target_us <= 0 {
        return true; // already at start — no seek needed
    }

    // Input-context seeks take AV_TIME_BASE units, which are microseconds.
    match ictx.seek(target_us, ..=target_us) {
        Ok(()) => true,
        Err(e) => {
            log::warn!(
                "seek soft-fail in {label} at {target_us} µs: {e} — reading from \
                 current position, gate will discard pre-roll"
            );
            false
        }
    }
}
