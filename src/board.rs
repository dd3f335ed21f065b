//! Single-board fan controller
//!
//! One `BoardController` owns one TCP connection to one physical
//! controller board and translates percent speed commands into Modbus
//! RTU write frames. All expected failures (bad index, disconnection,
//! malformed response) come back as `false` plus a statistics update,
//! never as a panic or error return.
//!
//! The connection is exclusively owned: the batch layer hands each
//! controller to at most one worker at a time, so no internal locking
//! is needed here.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::config::BoardConfig;
use crate::error::{CommandError, ConnectError};
use crate::frame::{self, ResponseFrame};
use crate::recorder::{BoardEvent, EventSink, FanCommand, TracingSink};

/// Cumulative per-board command statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CommandStats {
    pub total_commands: u64,
    pub success_commands: u64,
    pub failed_commands: u64,
    pub connection_errors: u64,
}

impl CommandStats {
    /// Fraction of commands that succeeded, in percent
    pub fn success_rate(&self) -> f64 {
        if self.total_commands == 0 {
            return 0.0;
        }
        self.success_commands as f64 / self.total_commands as f64 * 100.0
    }
}

impl std::fmt::Display for CommandStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} commands ({} ok, {} failed, {:.1}% success), {} connection errors",
            self.total_commands,
            self.success_commands,
            self.failed_commands,
            self.success_rate(),
            self.connection_errors
        )
    }
}

/// Controller for one physical board
pub struct BoardController {
    config: BoardConfig,
    board_id: usize,
    stream: Option<TcpStream>,
    connected: bool,
    stats: CommandStats,
    sink: Arc<dyn EventSink>,
}

impl BoardController {
    /// Create a controller that reports events through `tracing`
    pub fn new(config: BoardConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    /// Create a controller with an injected event sink
    pub fn with_sink(config: BoardConfig, sink: Arc<dyn EventSink>) -> Self {
        Self::with_board_id(config, sink, 1)
    }

    /// Batch construction: the board id is assigned by the owner before
    /// the init event is recorded.
    pub(crate) fn with_board_id(
        config: BoardConfig,
        sink: Arc<dyn EventSink>,
        board_id: usize,
    ) -> Self {
        let controller = Self {
            board_id,
            stream: None,
            connected: false,
            stats: CommandStats::default(),
            sink,
            config,
        };
        controller.sink.record(BoardEvent::Init {
            board_id: controller.board_id,
            endpoint: controller.config.endpoint(),
            fan_count: controller.config.fan_count,
        });
        controller
    }

    /// 1-based board number used in batch result maps
    pub fn board_id(&self) -> usize {
        self.board_id
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Snapshot of the cumulative statistics
    pub fn statistics(&self) -> CommandStats {
        self.stats
    }

    /// Record a statistics snapshot through the event sink
    pub fn report_statistics(&self) {
        self.sink.record(BoardEvent::Statistics {
            board_id: self.board_id,
            stats: self.stats,
        });
    }

    /// Open the TCP connection, closing any previous one first.
    ///
    /// Returns `false` on refusal, timeout, or any other network error;
    /// never propagates the error itself. Each failure increments
    /// `connection_errors`.
    pub async fn connect(&mut self) -> bool {
        // Drop closes any previous socket.
        self.stream.take();
        self.connected = false;

        let endpoint = self.config.endpoint();
        info!(board = self.board_id, %endpoint, "connecting");

        let attempt = tokio::time::timeout(self.config.timeout(), TcpStream::connect(&endpoint));
        let outcome: Result<TcpStream, ConnectError> = match attempt.await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                Err(ConnectError::Refused)
            }
            Ok(Err(e)) => Err(ConnectError::Network(e.to_string())),
            Err(_) => Err(ConnectError::TimedOut),
        };

        match outcome {
            Ok(stream) => {
                // Write frames are tiny; coalescing only adds latency.
                let _ = stream.set_nodelay(true);
                self.stream = Some(stream);
                self.connected = true;
                self.sink.record(BoardEvent::Connect {
                    board_id: self.board_id,
                    endpoint,
                    success: true,
                    detail: None,
                });
                true
            }
            Err(e) => {
                self.stats.connection_errors += 1;
                self.sink.record(BoardEvent::Connect {
                    board_id: self.board_id,
                    endpoint,
                    success: false,
                    detail: Some(e.to_string()),
                });
                false
            }
        }
    }

    /// Connect with the configured retry policy: up to
    /// `reconnect_attempts` attempts with `reconnect_delay` between
    /// them. Same never-fails contract as [`connect`](Self::connect).
    pub async fn connect_with_retry(&mut self) -> bool {
        let attempts = self.config.reconnect_attempts.max(1);
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.reconnect_delay()).await;
                debug!(
                    board = self.board_id,
                    attempt, attempts, "reconnect attempt"
                );
            }
            if self.connect().await {
                return true;
            }
        }
        false
    }

    /// Close the connection. Best effort: always clears the socket and
    /// the connected flag.
    pub fn disconnect(&mut self) {
        let had_stream = self.stream.take().is_some();
        if had_stream || self.connected {
            self.sink.record(BoardEvent::Disconnect {
                board_id: self.board_id,
            });
        }
        self.connected = false;
    }

    /// Run `op` inside a connect/disconnect scope. The disconnect runs
    /// on every exit path of `op`, whether the connect succeeded or not.
    pub async fn with_session<T, F>(&mut self, op: F) -> T
    where
        F: for<'a> FnOnce(&'a mut BoardController) -> BoxFuture<'a, T>,
    {
        self.connect().await;
        let result = op(self).await;
        self.disconnect();
        result
    }

    /// Set one fan's speed with a single-register write.
    ///
    /// Fails without any I/O when `fan_index` is out of range. The
    /// percentage is clamped to `[0, 100]` before PWM conversion.
    pub async fn set_fan_speed(&mut self, fan_index: u16, speed_percent: f64) -> bool {
        if !self.config.validate_fan_index(fan_index) {
            error!(
                board = self.board_id,
                fan = fan_index,
                fan_count = self.config.fan_count,
                "fan index out of range"
            );
            return false;
        }

        let percent = speed_percent.clamp(0.0, 100.0);
        let pwm = self.pwm_for_percent(percent);
        let register = self.config.register_address(fan_index);
        let request = frame::build_write_single(self.config.slave_addr, register, pwm);

        debug!(
            board = self.board_id,
            fan = fan_index,
            register = format_args!("0x{register:04X}"),
            pwm,
            request = %hex::encode_upper(&request),
            "write single register"
        );

        let result = self.send_command(&request).await;
        self.finish_command(
            vec![FanCommand {
                fan_index,
                register,
                pwm,
                percent,
            }],
            result,
        )
    }

    /// Set every fan on the board to the same speed with one
    /// write-multiple round trip.
    pub async fn set_all_fans_speed(&mut self, speed_percent: f64) -> bool {
        let percent = speed_percent.clamp(0.0, 100.0);
        let pwm = self.pwm_for_percent(percent);
        let values = vec![pwm; usize::from(self.config.fan_count)];
        let request =
            frame::build_write_multiple(self.config.slave_addr, self.config.start_register, &values);

        info!(
            board = self.board_id,
            fans = self.config.fan_count,
            percent,
            pwm,
            "set all fans"
        );

        let result = self.send_command(&request).await;
        let fans = (0..self.config.fan_count)
            .map(|fan_index| FanCommand {
                fan_index,
                register: self.config.register_address(fan_index),
                pwm,
                percent,
            })
            .collect();
        self.finish_command(fans, result)
    }

    /// Set every fan to its own speed with one write-multiple round
    /// trip. `speeds` must hold exactly `fan_count` entries; a
    /// wrong-length list fails without any I/O.
    pub async fn set_fans_speed_individual(&mut self, speeds: &[f64]) -> bool {
        if speeds.len() != usize::from(self.config.fan_count) {
            error!(
                board = self.board_id,
                expected = self.config.fan_count,
                actual = speeds.len(),
                "speed list length mismatch"
            );
            return false;
        }

        let fans: Vec<FanCommand> = speeds
            .iter()
            .enumerate()
            .map(|(i, &speed)| {
                let fan_index = i as u16;
                let percent = speed.clamp(0.0, 100.0);
                FanCommand {
                    fan_index,
                    register: self.config.register_address(fan_index),
                    pwm: self.pwm_for_percent(percent),
                    percent,
                }
            })
            .collect();
        let values: Vec<u16> = fans.iter().map(|fan| fan.pwm).collect();
        let request =
            frame::build_write_multiple(self.config.slave_addr, self.config.start_register, &values);

        info!(
            board = self.board_id,
            fans = fans.len(),
            "set individual fan speeds"
        );

        let result = self.send_command(&request).await;
        self.finish_command(fans, result)
    }

    /// Set a sparse subset of fans, one single-register round trip per
    /// entry. Failures do not short-circuit: every entry is attempted,
    /// and the call returns `true` only if all of them succeeded.
    pub async fn set_fans_speed_dict(&mut self, speeds: &BTreeMap<u16, f64>) -> bool {
        let mut failed = 0usize;
        for (&fan_index, &percent) in speeds {
            if !self.set_fan_speed(fan_index, percent).await {
                failed += 1;
            }
        }
        info!(
            board = self.board_id,
            requested = speeds.len(),
            failed,
            "sparse speed update complete"
        );
        failed == 0
    }

    /// Stop every fan on the board
    pub async fn stop_all_fans(&mut self) -> bool {
        self.set_all_fans_speed(0.0).await
    }

    /// Run every fan at full speed
    pub async fn set_all_fans_max(&mut self) -> bool {
        self.set_all_fans_speed(100.0).await
    }

    /// Convert a clamped percentage to the board's PWM range
    fn pwm_for_percent(&self, percent: f64) -> u16 {
        let pwm = (percent.clamp(0.0, 100.0) / 100.0 * f64::from(self.config.pwm_max)).round();
        (pwm as u16).clamp(self.config.pwm_min, self.config.pwm_max)
    }

    /// Send one request frame and read the response.
    ///
    /// Accumulates received bytes until a complete response is buffered
    /// (8 bytes for a write success, 5 for an exception) or the
    /// configured timeout elapses. Network failures mid-operation mark
    /// the controller disconnected.
    async fn send_command(&mut self, request: &[u8]) -> Result<ResponseFrame, CommandError> {
        let timeout = self.config.timeout();
        let stream = match (self.connected, self.stream.as_mut()) {
            (true, Some(stream)) => stream,
            _ => return Err(CommandError::NotConnected),
        };

        let exchange = async {
            stream.write_all(request).await?;

            let mut response = Vec::with_capacity(frame::WRITE_RESPONSE_LEN);
            let mut chunk = [0u8; 256];
            loop {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
                }
                response.extend_from_slice(&chunk[..n]);
                if frame::response_complete(&response) {
                    return Ok(response);
                }
            }
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        match outcome {
            Err(_) => Err(CommandError::ReceiveTimeout(timeout)),
            Ok(Err(e)) => {
                self.connected = false;
                warn!(board = self.board_id, error = %e, "connection lost mid-command");
                Err(match e.kind() {
                    io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof => CommandError::ConnectionReset,
                    _ => CommandError::Network(e.to_string()),
                })
            }
            Ok(Ok(response)) => {
                debug!(
                    board = self.board_id,
                    response = %hex::encode_upper(&response),
                    "response received"
                );
                frame::parse_response(&response)
            }
        }
    }

    /// Update statistics and record the command event
    fn finish_command(
        &mut self,
        fans: Vec<FanCommand>,
        result: Result<ResponseFrame, CommandError>,
    ) -> bool {
        self.stats.total_commands += 1;
        match result {
            Ok(_) => {
                self.stats.success_commands += 1;
                self.sink.record(BoardEvent::Command {
                    board_id: self.board_id,
                    fans,
                    success: true,
                    detail: None,
                });
                true
            }
            Err(e) => {
                self.stats.failed_commands += 1;
                warn!(board = self.board_id, error = %e, "command failed");
                self.sink.record(BoardEvent::Command {
                    board_id: self.board_id,
                    fans,
                    success: false,
                    detail: Some(e.to_string()),
                });
                false
            }
        }
    }
}

/// One-shot helper: connect, set a single fan, disconnect
pub async fn quick_set_fan(config: BoardConfig, fan_index: u16, speed_percent: f64) -> bool {
    let mut board = BoardController::new(config);
    board
        .with_session(|b| Box::pin(b.set_fan_speed(fan_index, speed_percent)))
        .await
}

/// One-shot helper: connect, set every fan to one speed, disconnect
pub async fn quick_set_all(config: BoardConfig, speed_percent: f64) -> bool {
    let mut board = BoardController::new(config);
    board
        .with_session(|b| Box::pin(b.set_all_fans_speed(speed_percent)))
        .await
}
