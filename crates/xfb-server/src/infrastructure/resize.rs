//! Resolution changes through an external helper program.
//!
//! The helper is run as `<program> <width> <height>` and prints the mode it
//! applied as `WxH`, optionally followed by `_<rate>` and a newline.

use std::process::{Command, Stdio};

use tracing::{debug, trace};
use xfb_core::protocol::Resolution;

use crate::application::serve_framebuffer::{ResizeError, ResolutionChanger};

/// Only this much helper output is considered.
const MAX_OUTPUT: usize = 255;

/// Parses `WxH[_rate][\n]`.
pub fn parse_resolution(output: &str) -> Result<Resolution, ResizeError> {
    let unparsable = || ResizeError::Unparsable(output.to_string());
    let mode = output.split('_').next().unwrap_or(output);
    let (width, height) = mode.split_once('x').ok_or_else(unparsable)?;
    let height = height.strip_suffix('\n').unwrap_or(height);
    Ok(Resolution {
        width: width.parse().map_err(|_| unparsable())?,
        height: height.parse().map_err(|_| unparsable())?,
    })
}

/// Runs the resize helper synchronously.
#[derive(Debug, Clone)]
pub struct SetresCommand {
    program: String,
    leading_args: Vec<String>,
}

impl SetresCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments passed before the width and height.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl ResolutionChanger for SetresCommand {
    fn change_resolution(&mut self, width: u16, height: u16) -> Result<Resolution, ResizeError> {
        debug!("running {} {width} {height}", self.program);
        let output = Command::new(&self.program)
            .args(&self.leading_args)
            .arg(width.to_string())
            .arg(height.to_string())
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|source| ResizeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = &output.stdout[..output.stdout.len().min(MAX_OUTPUT)];
        let text = String::from_utf8_lossy(stdout);
        trace!("{} printed {text:?}", self.program);
        if !output.status.success() {
            return Err(ResizeError::Failed {
                program: self.program.clone(),
                status: output.status.to_string(),
            });
        }
        parse_resolution(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_mode() {
        let r = parse_resolution("1366x768").unwrap();
        assert_eq!((r.width, r.height), (1366, 768));
    }

    #[test]
    fn test_parse_mode_with_rate_and_newline() {
        assert_eq!(
            parse_resolution("1920x1080_60.00\n").unwrap(),
            Resolution {
                width: 1920,
                height: 1080
            }
        );
        assert_eq!(parse_resolution("800x600\n").unwrap().height, 600);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "1024", "x768", "1024x", "1024x768 ", "abcx10", "70000x10"] {
            assert!(
                matches!(parse_resolution(bad), Err(ResizeError::Unparsable(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    /// A helper implemented as an inline shell script, `$1`/`$2` being the size.
    fn shell(body: &str) -> SetresCommand {
        SetresCommand::new("/bin/sh").with_leading_args(["-c", body, "setres"])
    }

    #[test]
    fn test_helper_receives_size_and_reply_is_parsed() {
        // Arrange
        let mut helper = shell(r#"echo "$(($1 - 6))x${2}_59.9""#);

        // Act
        let applied = helper.change_resolution(1286, 800).unwrap();

        // Assert
        assert_eq!(
            applied,
            Resolution {
                width: 1280,
                height: 800
            }
        );
    }

    #[test]
    fn test_failing_helper_is_reported() {
        let mut helper = shell("exit 3");

        let result = helper.change_resolution(800, 600);

        assert!(matches!(result, Err(ResizeError::Failed { .. })));
    }

    #[test]
    fn test_helper_exiting_nonzero_fails_despite_printing_a_mode() {
        // Arrange
        let mut helper = shell(r#"echo "${1}x${2}"; exit 1"#);

        // Act
        let result = helper.change_resolution(1024, 768);

        // Assert
        assert!(matches!(result, Err(ResizeError::Failed { .. })));
    }

    #[test]
    fn test_missing_helper_is_spawn_error() {
        let mut helper = SetresCommand::new("/nonexistent/setres");

        assert!(matches!(helper.change_resolution(800, 600), Err(ResizeError::Spawn { .. })));
    }
}
