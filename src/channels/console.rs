//! 控制台通道：逐行读取问题，打印回答，输入 exit 退出

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio_util::sync::CancellationToken;

use crate::channels::{ChannelKind, ChannelRunner};
use crate::core::AgentError;
use crate::dispatch::{CanonicalResult, ChannelPayload, Dispatcher};

pub const BANNER: &str = "Enhanced GitHub Repo Analyzer (type 'exit' to quit)";
pub const PROMPT: &str = "\nAsk a question (include <owner>/<repo> if needed): ";
pub const GOODBYE: &str = "Goodbye!";
pub const INVALID_INPUT_REPLY: &str = "Sorry, an error occurred: input is not valid UTF-8";

/// 去掉首尾空白后不区分大小写地等于 `exit`
pub fn is_exit_command(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case("exit")
}

pub struct ConsoleRunner<R, W> {
    dispatcher: Arc<Dispatcher>,
    reader: R,
    writer: W,
}

impl ConsoleRunner<BufReader<Stdin>, Stdout> {
    pub fn stdio(dispatcher: Arc<Dispatcher>) -> Self {
        Self::new(dispatcher, BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> ConsoleRunner<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(dispatcher: Arc<Dispatcher>, reader: R, writer: W) -> Self {
        Self {
            dispatcher,
            reader,
            writer,
        }
    }

    async fn write_line(&mut self, text: &str) -> Result<(), AgentError> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// 交互循环；exit、输入结束或关闭信号时正常返回
    pub async fn repl(&mut self, shutdown: &CancellationToken) -> Result<(), AgentError> {
        tracing::info!("Starting CLI interface");
        self.write_line(BANNER).await?;

        let mut buf = Vec::new();
        loop {
            self.writer.write_all(PROMPT.as_bytes()).await?;
            self.writer.flush().await?;

            buf.clear();
            let read = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("console: shutdown requested");
                    return Ok(());
                }
                read = self.reader.read_until(b'\n', &mut buf) => read?,
            };
            if read == 0 {
                tracing::info!("console: end of input");
                return Ok(());
            }

            // 坏行只影响本行，循环继续
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line.to_string(),
                Err(e) => {
                    tracing::warn!("console: discarding line that is not valid UTF-8: {}", e);
                    self.write_line(INVALID_INPUT_REPLY).await?;
                    continue;
                }
            };

            if is_exit_command(&line) {
                self.write_line(GOODBYE).await?;
                return Ok(());
            }
            if line.trim().is_empty() {
                continue;
            }

            let outcome = self
                .dispatcher
                .dispatch_payload(
                    "console",
                    ChannelPayload::Text {
                        text: &line,
                        caller_id: None,
                    },
                )
                .await;
            let reply = match outcome {
                Ok(CanonicalResult::Success { text }) => text,
                Ok(CanonicalResult::Failure { error }) => {
                    tracing::error!("Error processing request: {}", error);
                    format!("Sorry, an error occurred: {}", error)
                }
                Err(e) => {
                    tracing::error!("Error processing request: {}", e);
                    format!("Sorry, an error occurred: {}", e)
                }
            };
            self.write_line(&reply).await?;
        }
    }

    pub fn into_writer(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<R, W> ChannelRunner for ConsoleRunner<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn kind(&self) -> ChannelKind {
        ChannelKind::Console
    }

    async fn run(mut self: Box<Self>, shutdown: CancellationToken) -> Result<(), AgentError> {
        self.repl(&shutdown).await
    }
}
