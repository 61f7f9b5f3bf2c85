use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::trace;

const SILENCE_START_MARKER: &str = "silence_start";
const SILENCE_END_MARKER: &str = "silence_end";

/// 单路流的静音状态，初始为 NotSilent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Silent,
    #[default]
    NotSilent,
}

/// 边沿触发的静音事件
#[derive(Debug, Clone, PartialEq)]
pub enum SilenceEvent {
    SilenceStarted {
        identifier: String,
        at: DateTime<Local>,
    },
    SilenceEnded {
        identifier: String,
        at: DateTime<Local>,
    },
}

/// 将解码器诊断输出转换为静音事件
///
/// 只检测标记是否出现，不解析时间戳或时长。
/// 已处于 Silent 时重复的 silence_start 会被忽略 (告警去重)。
pub struct SilenceParser {
    identifier: String,
    state: StreamState,
}

impl SilenceParser {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            state: StreamState::NotSilent,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn feed(&mut self, line: &str) -> Option<SilenceEvent> {
        if line.contains(SILENCE_START_MARKER) {
            if self.state == StreamState::Silent {
                return None;
            }
            self.state = StreamState::Silent;
            return Some(SilenceEvent::SilenceStarted {
                identifier: self.identifier.clone(),
                at: Local::now(),
            });
        }

        if line.contains(SILENCE_END_MARKER) {
            if self.state == StreamState::NotSilent {
                return None;
            }
            self.state = StreamState::NotSilent;
            return Some(SilenceEvent::SilenceEnded {
                identifier: self.identifier.clone(),
                at: Local::now(),
            });
        }

        trace!(stream = %self.identifier, "decoder: {}", line);
        None
    }
}
