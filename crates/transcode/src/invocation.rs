//! Encoder command lines.

use encore_formats::{Format, Shortcut};
use encore_pipeline::{CHANNELS, SAMPLE_RATE, Stage};
use std::ffi::OsStr;
use std::path::Path;

/// Everything that decides the encoder stages of one production.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Invocation<'a> {
    pub ffmpeg: &'a str,
    pub format: &'a Format,
    /// Remux from a cached artifact instead of encoding the master.
    pub shortcut: Option<&'a Shortcut>,
    /// Stage one receives raw PCM silence instead of a media file.
    pub silence: bool,
    pub metadata: &'a Path,
    /// Cover art to attach as a video stream.
    pub art: Option<&'a Path>,
    pub target: &'a OsStr,
}

impl Invocation<'_> {
    /// Formats with an alternate command encode through a third-party
    /// program: decode to WAV, encode with the program, then mux and tag.
    /// Shortcuts are always a plain remux.
    pub fn uses_alt_command(&self) -> bool {
        self.shortcut.is_none() && self.format.alt_command.is_some()
    }

    pub fn stages(&self) -> Vec<Stage> {
        match (&self.format.alt_command, self.uses_alt_command()) {
            (Some(alt), true) => {
                let decode = Stage::new(self.ffmpeg, ["-v", "error"])
                    .args(self.input_args())
                    .args(["-f", "wav", "-map_metadata", "-1", "-"]);
                vec![decode, alt.stage(), self.final_stage(&["-i", "-"])]
            },
            _ => vec![self.final_stage(&self.input_args())],
        }
    }

    fn input_args(&self) -> Vec<String> {
        if self.silence {
            vec![
                "-f".into(),
                "s16le".into(),
                "-ar".into(),
                SAMPLE_RATE.to_string(),
                "-ac".into(),
                CHANNELS.to_string(),
                "-i".into(),
                "-".into(),
            ]
        } else {
            vec!["-i".into(), "-".into()]
        }
    }

    fn codec_args(&self) -> Vec<String> {
        match self.shortcut {
            Some(shortcut) => shortcut.args.clone(),
            // Raw PCM can't be stream-copied into a container that expects
            // an encoded stream.
            None if self.silence => strip_copy(&self.format.args),
            None => self.format.args.clone(),
        }
    }

    fn final_stage(&self, input: &[impl AsRef<str>]) -> Stage {
        let mut stage = Stage::new(self.ffmpeg, ["-v", "error"])
            .args(input.iter().map(|s| s.as_ref()))
            .arg("-i")
            .arg(self.metadata.to_string_lossy());
        if let Some(art) = self.art {
            stage = stage.arg("-i").arg(art.to_string_lossy());
        }
        stage = stage.args(self.codec_args()).args(["-map_metadata", "1", "-map", "a"]);
        if self.art.is_some() {
            stage = stage.args([
                "-map",
                "2",
                "-metadata:s:v",
                "title=Album cover",
                "-metadata:s:v",
                "comment=Cover (front)",
                "-disposition:v",
                "attached_pic",
                "-codec:v",
                "copy",
            ]);
        }
        stage.arg("-y").arg(self.target.to_string_lossy())
    }
}

fn strip_copy(args: &[String]) -> Vec<String> {
    let mut args = args.to_vec();
    if let Some(at) = args.windows(2).position(|pair| pair[0] == "-codec:a" && pair[1] == "copy") {
        args.drain(at..at + 2);
    }
    args
}
