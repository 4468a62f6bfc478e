//! A handful of raw `AVCodecContext` pokes that ffmpeg-next's safe API does
//! not expose, needed to build a decoder context "from scratch" (no
//! demuxed stream to copy `Parameters` from). Grounded on the same
//! `as_mut_ptr()`-poking style used throughout `oddity-ai-video-rs`'s
//! `ffi.rs` (e.g. `set_decoder_context_time_base`).

use ffmpeg_next as ffmpeg;
use ffmpeg::codec::context::Context;
use ffmpeg::ffi as sys;

/// Installs `extradata` (codec-specific out-of-band configuration, e.g. SPS/
/// PPS or an `AudioSpecificConfig`) on a not-yet-opened decoder context.
/// ffmpeg-next has no safe setter for this when the context wasn't built
/// from a demuxed stream's `Parameters`.
pub fn set_extradata(context: &mut Context, extradata: &[u8]) {
    if extradata.is_empty() {
        return;
    }
    unsafe {
        let padded_len = extradata.len() + sys::AV_INPUT_BUFFER_PADDING_SIZE as usize;
        let ptr = sys::av_mallocz(padded_len) as *mut u8;
        if ptr.is_null() {
            log::warn!("pipeline: av_mallocz failed allocating extradata");
            return;
        }
        std::ptr::copy_nonoverlapping(extradata.as_ptr(), ptr, extradata.len());
        let raw = context.as_mut_ptr();
        if !(*raw).extradata.is_null() {
            sys::av_free((*raw).extradata as *mut std::ffi::c_void);
        }
        (*raw).extradata = ptr;
        (*raw).extradata_size = extradata.len() as i32;
    }
}

/// Seeds sample rate and channel count on a raw-PCM decoder context
/// (PCMA/PCMU), which carries no in-band header for the decoder to pick
/// these up from. Uses the legacy `channels`/`channel_layout` fields rather
/// than the newer `ch_layout` struct, matching what this crate's
/// ffmpeg-next version still exposes; see DESIGN.md.
#[allow(deprecated)]
pub fn set_audio_params(context: &mut Context, sample_rate: u32, channels: u16) {
    let channels = channels.max(1) as i32;
    unsafe {
        let raw = context.as_mut_ptr();
        (*raw).sample_rate = sample_rate as i32;
        (*raw).channels = channels;
        (*raw).channel_layout = sys::av_get_default_channel_layout(channels) as u64;
    }
}
