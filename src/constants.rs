use rand::Rng;

/// Expected database schema version
pub const EXPECTED_DB_VERSION: &str = "1";

/// Longest media accepted into the library
pub const MAX_MEDIA_DURATION_US: i64 = 24 * 3600 * 1_000_000;

/// DASH profile of the published manifest
pub const DASH_PROFILE: &str = "urn:mpeg:dash:profile:isoff-live:2011";

/// UTCTiming scheme the manifest advertises
pub const UTC_TIMING_SCHEME: &str = "urn:mpeg:dash:utc:http-iso:2014";

pub const AUDIO_CHANNEL_SCHEME: &str = "urn:mpeg:dash:23003:3:audio_channel_configuration:2011";

/// Single audio representation: AAC-LC, 44.1 kHz, stereo, 96 kbps
pub const AUDIO_CODEC: &str = "mp4a.40.2";
pub const AUDIO_MIME: &str = "audio/mp4";
pub const SAMPLE_RATE: u32 = 44100;
pub const CHANNELS: u32 = 2;
pub const BANDWIDTH: u32 = 96_000;

/// Segment artifact names inside `<content_dir>/<segment id>/`
pub const INIT_NAME: &str = "init.m4s";
pub const CHUNK_TEMPLATE: &str = "chunk-$Number%05d$.m4s";

/// Written next to the artifacts once an encode succeeds: `<begin_us> <stop_us>`
pub const CUT_NAME: &str = "encoded.cut";

/// Chunk file name for a 1-based chunk number
pub fn chunk_name(number: u64) -> String {
    format!("chunk-{:05}.m4s", number)
}

/// Parse the number back out of a chunk file name
pub fn parse_chunk_name(name: &str) -> Option<u64> {
    name.strip_prefix("chunk-")?.strip_suffix(".m4s")?.parse().ok()
}

/// Generate a random alphanumeric id of the given length
pub fn generate_id(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(length)
        .map(char::from)
        .collect::<String>()
}
