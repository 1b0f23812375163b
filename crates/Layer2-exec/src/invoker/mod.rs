//! Invoker - 외부 도구 호출 추상화
//!
//! `Invoker`를 구현하면 새로운 실행 백엔드를 추가할 수 있습니다.
//! 기본 구현은 로컬 프로세스를 띄우는 `LocalInvoker`입니다.

mod local;

pub use local::LocalInvoker;

use crate::command::CommandResult;
use crate::progress::ProgressReporter;
use async_trait::async_trait;
use conduit_foundation::{CancellationToken, Result};
use std::time::Duration;

/// 단일 호출 옵션
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    /// 호출 전체 제한 시간
    pub timeout: Duration,

    /// 취소 신호 (발생 시 프로세스 종료 후 `Error::Cancelled`)
    pub cancel: CancellationToken,

    /// 도구가 보내는 진행률 프레임을 전달할 곳
    pub progress: Option<ProgressReporter>,
}

impl InvokeOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, reporter: ProgressReporter) -> Self {
        self.progress = Some(reporter);
        self
    }
}

/// Invoker trait
///
/// `Ok(result)` with `success == false` means the tool ran and reported
/// failure; `Err` means it could not be run to completion.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(
        &self,
        command: &str,
        args: &[String],
        options: InvokeOptions,
    ) -> Result<CommandResult>;

    fn name(&self) -> &'static str;
}
