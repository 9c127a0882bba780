use crate::request::TrackTags;
use encore_formats::{Format, Usage};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use rand::Rng;
use rand::distr::Alphanumeric;
use std::path::{Path, PathBuf};

/// Characters escaped in download filenames, on top of non-ASCII. `;` would
/// otherwise end the `Content-Disposition` parameter early.
const FILENAME: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b';')
    .add(b'<')
    .add(b'>')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

const SUFFIX_LEN: usize = 16;

/// A random blob path for a new artifact: `{prefix}/{abc}/{abc...}.{ext}`.
///
/// The first three characters fan artifacts out across directories.
pub(crate) fn random_blob_path(prefix: &Path, extension: &str) -> PathBuf {
    let suffix: String = rand::rng().sample_iter(Alphanumeric).take(SUFFIX_LEN).map(char::from).collect();
    prefix.join(&suffix[..3]).join(format!("{suffix}.{extension}"))
}

/// `Artist - Album - 01 Title.ext`, omitting whatever the tags lack.
pub fn download_filename(tags: &TrackTags, extension: &str) -> String {
    let mut name = String::new();
    if !tags.artist.is_empty() {
        name.push_str(&tags.artist);
        name.push_str(" - ");
    }
    if let Some(album) = &tags.album {
        name.push_str(album);
        name.push_str(" - ");
    }
    if let Some(track) = tags.track {
        name.push_str(&format!("{track:02} "));
    }
    name.push_str(&tags.title);
    name.push('.');
    name.push_str(extension);
    name
}

pub fn encode_filename(filename: &str) -> String {
    utf8_percent_encode(filename, FILENAME).to_string()
}

/// Downloads are attachments named after the track; streams play inline.
pub fn content_disposition(format: &Format, filename: &str) -> String {
    match format.usage {
        Usage::Download => {
            let encoded = encode_filename(filename);
            format!("attachment; filename={encoded}; filename*=utf-8''{encoded}")
        },
        Usage::Stream | Usage::StreamLow => "inline".to_string(),
    }
}

pub(crate) fn cache_control(published: bool) -> &'static str {
    if published { "public, immutable" } else { "private" }
}
