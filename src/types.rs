// src/types.rs
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::dsp::TickSummary;

// 控制端发给会话线程的命令
#[derive(Clone, Debug)]
pub enum SessionCommand {
    Connect,
    StartStream,
    StopStream,
    Reset,
    UpdateConfig(PipelineConfig),
    // None 使用配置里的 trial_name
    StartRecording(Option<String>),
    StopRecording,
    Shutdown,
}

// 会话线程发回的事件
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Status(String),
    Streaming(bool),
    Recording(bool),
    IntervalChanged(Duration),
    Frame(TickSummary),
}
