use crate::config::FramingConfig;
use crate::error::FramerError;

/// Decoding state for a single session's byte stream (spec.md §3, §4.4).
#[derive(Debug, Clone)]
pub enum FramingState {
    AwaitingFrame,
    ReadingOctetCount {
        digits: Vec<u8>,
    },
    ReadingOctetCountedBody {
        len: usize,
        body: Vec<u8>,
    },
    ReadingLfDelimited {
        body: Vec<u8>,
    },
    /// Consuming and dropping `remaining` bytes of an oversized frame.
    /// `truncated` accumulates the first `max_frame_size` bytes so they can
    /// be forwarded as a single truncated record if `discard_truncated_msg`
    /// is false; it stops growing once it reaches that cap.
    Discarding {
        remaining: usize,
        truncated: Option<Vec<u8>>,
    },
    /// LF-delimited frame that hit `max_frame_size` without a terminator;
    /// consumes bytes until the next terminator appears.
    DiscardingUntilTerminator,
}

impl Default for FramingState {
    fn default() -> Self {
        Self::AwaitingFrame
    }
}

/// A fully decoded record ready for `MessageSink::submit`, or a side-effect
/// the session loop must act on (log a truncation warning).
#[derive(Debug, PartialEq, Eq)]
pub enum FrameEvent {
    Record(Vec<u8>),
    TruncationWarning,
}

/// Which wire framing a listener uses. Octet-counted is RFC 6587; LF-delimited
/// is the traditional syslog framing (spec.md §4.4, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingKind {
    OctetCounted,
    LfDelimited,
}

pub struct Framer {
    kind: FramingKind,
    max_frame_size: usize,
    config: FramingConfig,
    state: FramingState,
}

impl Framer {
    pub fn new(kind: FramingKind, max_frame_size: usize, config: FramingConfig) -> Self {
        Self {
            kind,
            max_frame_size,
            config,
            state: FramingState::AwaitingFrame,
        }
    }

    pub fn state(&self) -> &FramingState {
        &self.state
    }

    /// Feed newly-read bytes into the decoder, emitting zero or more events.
    /// Bytes are consumed incrementally; leftover bytes remain buffered in
    /// `self.state` across calls so a record split across TCP segments still
    /// decodes correctly.
    pub fn feed(&mut self, input: &[u8]) -> Result<Vec<FrameEvent>, FramerError> {
        let mut events = Vec::new();
        let mut cursor = 0usize;
        while cursor < input.len() {
            cursor += self.step(&input[cursor..], &mut events)?;
        }
        Ok(events)
    }

    fn step(&mut self, input: &[u8], events: &mut Vec<FrameEvent>) -> Result<usize, FramerError> {
        match std::mem::replace(&mut self.state, FramingState::AwaitingFrame) {
            FramingState::AwaitingFrame => {
                self.state = match self.kind {
                    FramingKind::OctetCounted => FramingState::ReadingOctetCount { digits: Vec::new() },
                    FramingKind::LfDelimited => FramingState::ReadingLfDelimited { body: Vec::new() },
                };
                Ok(0)
            }
            FramingState::ReadingOctetCount { mut digits } => {
                let b = input[0];
                if b == b' ' {
                    let text = std::str::from_utf8(&digits).map_err(|_| FramerError::InvalidLengthDigit)?;
                    let len: usize = text.parse().map_err(|_| FramerError::InvalidLengthDigit)?;
                    self.state = if len > self.max_frame_size {
                        let truncated = if self.config.discard_truncated_msg {
                            None
                        } else {
                            Some(Vec::with_capacity(self.max_frame_size))
                        };
                        FramingState::Discarding { remaining: len, truncated }
                    } else {
                        FramingState::ReadingOctetCountedBody {
                            len,
                            body: Vec::with_capacity(len),
                        }
                    };
                } else if b.is_ascii_digit() {
                    digits.push(b);
                    self.state = FramingState::ReadingOctetCount { digits };
                } else {
                    return Err(FramerError::InvalidLengthDigit);
                }
                Ok(1)
            }
            FramingState::ReadingOctetCountedBody { len, mut body } => {
                let need = len - body.len();
                let take = need.min(input.len());
                body.extend_from_slice(&input[..take]);
                if body.len() == len {
                    events.push(FrameEvent::Record(body));
                    self.state = FramingState::AwaitingFrame;
                } else {
                    self.state = FramingState::ReadingOctetCountedBody { len, body };
                }
                Ok(take)
            }
            FramingState::ReadingLfDelimited { mut body } => {
                let b = input[0];
                let is_terminator = if self.config.disable_lf_delim {
                    Some(b) == self.config.addtl_frame_delim
                } else {
                    b == b'\n' || Some(b) == self.config.addtl_frame_delim
                };
                if is_terminator {
                    let record = strip_sp_framing_fix(body, self.config.sp_framing_fix);
                    events.push(FrameEvent::Record(record));
                    self.state = FramingState::AwaitingFrame;
                } else if body.len() >= self.max_frame_size {
                    events.push(FrameEvent::TruncationWarning);
                    if !self.config.discard_truncated_msg {
                        events.push(FrameEvent::Record(body));
                    }
                    self.state = FramingState::DiscardingUntilTerminator;
                } else {
                    body.push(b);
                    self.state = FramingState::ReadingLfDelimited { body };
                }
                Ok(1)
            }
            FramingState::Discarding { remaining, mut truncated } => {
                let take = remaining.min(input.len());
                if let Some(buf) = truncated.as_mut() {
                    let room = self.max_frame_size.saturating_sub(buf.len());
                    let grab = room.min(take);
                    buf.extend_from_slice(&input[..grab]);
                }
                let left = remaining - take;
                if left == 0 {
                    events.push(FrameEvent::TruncationWarning);
                    if let Some(buf) = truncated {
                        events.push(FrameEvent::Record(buf));
                    }
                    self.state = FramingState::AwaitingFrame;
                } else {
                    self.state = FramingState::Discarding { remaining: left, truncated };
                }
                Ok(take)
            }
            FramingState::DiscardingUntilTerminator => {
                let b = input[0];
                let is_terminator = b == b'\n' || Some(b) == self.config.addtl_frame_delim;
                self.state = if is_terminator {
                    FramingState::AwaitingFrame
                } else {
                    FramingState::DiscardingUntilTerminator
                };
                Ok(1)
            }
        }
    }
}

fn strip_sp_framing_fix(mut body: Vec<u8>, enabled: bool) -> Vec<u8> {
    if enabled && body.first() == Some(&b' ') {
        body.remove(0);
    }
    body
}
