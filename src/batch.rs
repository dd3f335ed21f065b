//! Batch orchestration across controller boards
//!
//! A `BatchController` owns one [`BoardController`] per physical board
//! and fans commands out to them under bounded concurrency. Every
//! fan-out call returns a complete map keyed by 1-based `board_id`,
//! whatever subset of boards failed; partial failure is data, not an
//! error.
//!
//! Coordination contract: each board is handed to exactly one worker
//! per batch call (its `Mutex` enforces exclusive access), concurrency
//! is bounded by a semaphore of `max_workers` permits, and all batch
//! statistics are merged by the coordinating task after the workers
//! finish, so counters never race.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info};

use crate::board::{BoardController, CommandStats};
use crate::config::{generate_board_configs, BoardConfig};
use crate::recorder::{EventSink, TracingSink};

/// Default bound on concurrent per-board workers
pub const DEFAULT_MAX_WORKERS: usize = 10;

/// Batch-level cumulative statistics.
///
/// `connected_boards`/`failed_boards` reflect the most recent
/// `connect_all`; the command counters accumulate across calls, one
/// count per board per batch operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub total_boards: usize,
    pub connected_boards: usize,
    pub failed_boards: usize,
    pub total_commands: u64,
    pub success_commands: u64,
    pub failed_commands: u64,
}

impl BatchStats {
    /// Fraction of batch commands that succeeded, in percent
    pub fn success_rate(&self) -> f64 {
        if self.total_commands == 0 {
            return 0.0;
        }
        self.success_commands as f64 / self.total_commands as f64 * 100.0
    }
}

impl std::fmt::Display for BatchStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} boards connected, {} commands ({} ok, {} failed, {:.1}% success)",
            self.connected_boards,
            self.total_boards,
            self.total_commands,
            self.success_commands,
            self.failed_commands,
            self.success_rate()
        )
    }
}

/// Read-only snapshot of one board's state
#[derive(Debug, Clone, Serialize)]
pub struct BoardStatus {
    pub board_id: usize,
    pub endpoint: String,
    pub fan_count: u16,
    pub is_connected: bool,
    pub stats: CommandStats,
}

/// Orchestrator for a wall of controller boards
pub struct BatchController {
    boards: Vec<Arc<Mutex<BoardController>>>,
    stats: BatchStats,
}

impl BatchController {
    /// Build a controller per config, assigning 1-based board ids in
    /// config order. Fails only on invalid configuration.
    pub fn new(configs: Vec<BoardConfig>) -> Result<Self> {
        Self::with_sink(configs, Arc::new(TracingSink))
    }

    /// Like [`new`](Self::new) with an injected event sink shared by
    /// every board controller.
    pub fn with_sink(configs: Vec<BoardConfig>, sink: Arc<dyn EventSink>) -> Result<Self> {
        if configs.is_empty() {
            anyhow::bail!("batch controller needs at least one board config");
        }
        for config in &configs {
            config.validate()?;
        }

        let total_fans: u32 = configs.iter().map(|c| u32::from(c.fan_count)).sum();
        info!(
            boards = configs.len(),
            total_fans,
            first = %configs[0].endpoint(),
            last = %configs[configs.len() - 1].endpoint(),
            "batch controller initialized"
        );

        let boards = configs
            .into_iter()
            .enumerate()
            .map(|(index, config)| {
                let board = BoardController::with_board_id(config, Arc::clone(&sink), index + 1);
                Arc::new(Mutex::new(board))
            })
            .collect::<Vec<_>>();

        let stats = BatchStats {
            total_boards: boards.len(),
            ..BatchStats::default()
        };
        Ok(Self { boards, stats })
    }

    /// Build a wall of sequential-IP boards
    /// (`base_ip + start_ip`, `base_ip + start_ip + 1`, ...).
    pub fn with_generated(
        base_ip: &str,
        start_ip: u32,
        board_count: usize,
        fans_per_board: u16,
    ) -> Result<Self> {
        Self::new(generate_board_configs(
            base_ip,
            start_ip,
            board_count,
            fans_per_board,
        ))
    }

    /// Number of boards under management
    pub fn board_count(&self) -> usize {
        self.boards.len()
    }

    /// Snapshot of the batch statistics
    pub fn statistics(&self) -> BatchStats {
        self.stats
    }

    /// Connect every board concurrently.
    ///
    /// Returns the per-board outcome map and refreshes the
    /// `connected_boards`/`failed_boards` counters to this call's
    /// result.
    pub async fn connect_all(&mut self, max_workers: usize) -> BTreeMap<usize, bool> {
        info!(
            boards = self.boards.len(),
            max_workers, "connecting all boards"
        );

        let results = self
            .fan_out(max_workers, |_, board| {
                Box::pin(async move { board.lock().await.connect().await })
            })
            .await;

        let connected = results.values().filter(|ok| **ok).count();
        self.stats.connected_boards = connected;
        self.stats.failed_boards = results.len() - connected;
        info!(
            connected,
            failed = self.stats.failed_boards,
            "connect_all complete"
        );
        results
    }

    /// Disconnect every board.
    ///
    /// Sequential on purpose: closing a socket is cheap and local, and
    /// a plain loop leaves no room for concurrent close races.
    pub async fn disconnect_all(&mut self) {
        for board in &self.boards {
            board.lock().await.disconnect();
        }
        info!(boards = self.boards.len(), "all boards disconnected");
    }

    /// Set every fan on every board to the same speed, one bulk write
    /// per board, fanned out concurrently.
    pub async fn set_all_boards_speed(
        &mut self,
        speed_percent: f64,
        max_workers: usize,
    ) -> BTreeMap<usize, bool> {
        info!(
            boards = self.boards.len(),
            percent = speed_percent,
            "setting uniform speed on all boards"
        );

        let results = self
            .fan_out(max_workers, move |_, board| {
                Box::pin(async move { board.lock().await.set_all_fans_speed(speed_percent).await })
            })
            .await;

        self.merge_command_results(&results);
        results
    }

    /// Set per-fan speeds on one board. Fails without I/O when
    /// `board_index` is out of range.
    pub async fn set_board_speed_individual(&mut self, board_index: usize, speeds: &[f64]) -> bool {
        let Some(board) = self.boards.get(board_index) else {
            error!(
                board_index,
                boards = self.boards.len(),
                "board index out of range"
            );
            return false;
        };

        let success = board.lock().await.set_fans_speed_individual(speeds).await;

        self.stats.total_commands += 1;
        if success {
            self.stats.success_commands += 1;
        } else {
            self.stats.failed_commands += 1;
        }
        success
    }

    /// Set per-fan speeds on every board: `speed_matrix[i]` is applied
    /// to board `i`. The matrix must hold exactly one row per board;
    /// a wrong-shape matrix fails the whole call before any I/O and
    /// returns an empty map.
    pub async fn set_all_boards_individual(
        &mut self,
        speed_matrix: &[Vec<f64>],
        max_workers: usize,
    ) -> BTreeMap<usize, bool> {
        if speed_matrix.len() != self.boards.len() {
            error!(
                expected = self.boards.len(),
                actual = speed_matrix.len(),
                "speed matrix size mismatch"
            );
            return BTreeMap::new();
        }

        info!(boards = self.boards.len(), "setting per-board fan speeds");

        let matrix = Arc::new(speed_matrix.to_vec());
        let results = self
            .fan_out(max_workers, move |index, board| {
                let speeds = matrix[index].clone();
                Box::pin(async move { board.lock().await.set_fans_speed_individual(&speeds).await })
            })
            .await;

        self.merge_command_results(&results);
        results
    }

    /// Stop every fan on every board
    pub async fn stop_all_boards(&mut self, max_workers: usize) -> BTreeMap<usize, bool> {
        self.set_all_boards_speed(0.0, max_workers).await
    }

    /// Snapshot one board's state; `None` when the index is out of
    /// range. No I/O is performed.
    pub async fn board_status(&self, board_index: usize) -> Option<BoardStatus> {
        let board = self.boards.get(board_index)?;
        let board = board.lock().await;
        Some(BoardStatus {
            board_id: board.board_id(),
            endpoint: board.config().endpoint(),
            fan_count: board.config().fan_count,
            is_connected: board.is_connected(),
            stats: board.statistics(),
        })
    }

    /// Snapshot every board's state in board order
    pub async fn all_status(&self) -> Vec<BoardStatus> {
        let mut statuses = Vec::with_capacity(self.boards.len());
        for index in 0..self.boards.len() {
            if let Some(status) = self.board_status(index).await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Run `op` once per board with at most `max_workers` in flight,
    /// and collect the outcomes keyed by 1-based board id.
    ///
    /// Each board's controller sits behind its own mutex and is given
    /// to exactly one worker, so no board ever sees two concurrent
    /// operations from the batch layer.
    async fn fan_out<F>(&self, max_workers: usize, op: F) -> BTreeMap<usize, bool>
    where
        F: Fn(usize, Arc<Mutex<BoardController>>) -> BoxFuture<'static, bool>,
    {
        let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
        let workers = self.boards.iter().enumerate().map(|(index, board)| {
            let semaphore = Arc::clone(&semaphore);
            let task = op(index, Arc::clone(board));
            async move {
                // The semaphore is never closed, so acquire only fails
                // if the runtime is tearing down; the permit (inside
                // the Ok) is held until this worker finishes.
                let _permit = semaphore.acquire_owned().await;
                (index + 1, task.await)
            }
        });
        join_all(workers).await.into_iter().collect()
    }

    /// Fold per-board outcomes into the batch counters. Runs on the
    /// coordinating task only, after all workers have returned.
    fn merge_command_results(&mut self, results: &BTreeMap<usize, bool>) {
        for success in results.values() {
            self.stats.total_commands += 1;
            if *success {
                self.stats.success_commands += 1;
            } else {
                self.stats.failed_commands += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::testing::{config_for, spawn_mock_board, MockReply};
    use crate::frame;

    async fn refused_config() -> BoardConfig {
        // Bind then drop to obtain a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        config_for(addr)
    }

    #[test]
    fn test_construction_rejects_invalid_config() {
        let bad = BoardConfig {
            slave_addr: 0,
            ..BoardConfig::default()
        };
        assert!(BatchController::new(vec![bad]).is_err());
        assert!(BatchController::new(Vec::new()).is_err());
    }

    #[test]
    fn test_generated_wall_shape() {
        let batch = BatchController::with_generated("192.168.2.", 1, 100, 16).unwrap();
        assert_eq!(batch.board_count(), 100);
        assert_eq!(batch.statistics().total_boards, 100);
    }

    #[tokio::test]
    async fn test_result_maps_cover_every_board_under_partial_failure() {
        let (addr_a, _log_a) = spawn_mock_board(MockReply::Ok).await;
        let (addr_b, _log_b) = spawn_mock_board(MockReply::Ok).await;
        let configs = vec![config_for(addr_a), refused_config().await, config_for(addr_b)];
        let mut batch = BatchController::new(configs).unwrap();

        let connects = batch.connect_all(DEFAULT_MAX_WORKERS).await;
        assert_eq!(
            connects.keys().copied().collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(connects[&1]);
        assert!(!connects[&2]);
        assert!(connects[&3]);

        let results = batch.set_all_boards_speed(50.0, DEFAULT_MAX_WORKERS).await;
        assert_eq!(results.len(), 3);
        assert!(results.keys().copied().eq(1..=3));

        batch.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_matrix_shape_precondition_blocks_all_io() {
        let (addr_a, log_a) = spawn_mock_board(MockReply::Ok).await;
        let (addr_b, log_b) = spawn_mock_board(MockReply::Ok).await;
        let mut batch =
            BatchController::new(vec![config_for(addr_a), config_for(addr_b)]).unwrap();
        batch.connect_all(DEFAULT_MAX_WORKERS).await;

        let wrong_shape = vec![vec![50.0; 16]]; // one row for two boards
        let results = batch
            .set_all_boards_individual(&wrong_shape, DEFAULT_MAX_WORKERS)
            .await;

        assert!(results.is_empty());
        assert!(log_a.lock().unwrap().is_empty());
        assert!(log_b.lock().unwrap().is_empty());
        assert_eq!(batch.statistics().total_commands, 0);
    }

    #[tokio::test]
    async fn test_individual_matrix_applies_row_per_board() {
        let (addr_a, log_a) = spawn_mock_board(MockReply::Ok).await;
        let (addr_b, log_b) = spawn_mock_board(MockReply::Ok).await;
        let mut batch =
            BatchController::new(vec![config_for(addr_a), config_for(addr_b)]).unwrap();
        batch.connect_all(DEFAULT_MAX_WORKERS).await;

        let mut matrix = vec![vec![0.0; 16], vec![0.0; 16]];
        matrix[0][0] = 100.0;
        matrix[1][0] = 50.0;
        let results = batch
            .set_all_boards_individual(&matrix, DEFAULT_MAX_WORKERS)
            .await;

        assert_eq!(results, BTreeMap::from([(1, true), (2, true)]));

        // Each board got exactly its own row.
        let frames_a = log_a.lock().unwrap();
        let frames_b = log_b.lock().unwrap();
        assert_eq!(frames_a.len(), 1);
        assert_eq!(frames_b.len(), 1);
        assert_eq!(&frames_a[0][7..9], &[0x03, 0xE8]); // pwm 1000
        assert_eq!(&frames_b[0][7..9], &[0x01, 0xF4]); // pwm 500
    }

    #[tokio::test]
    async fn test_bounded_workers_produce_one_result_per_board() {
        let mut configs = Vec::new();
        let mut logs = Vec::new();
        for _ in 0..6 {
            let (addr, log) = spawn_mock_board(MockReply::Ok).await;
            configs.push(config_for(addr));
            logs.push(log);
        }
        let mut batch = BatchController::new(configs).unwrap();
        batch.connect_all(2).await;

        // Fewer workers than boards: every board still gets exactly one
        // command, and every board reports exactly one result.
        let results = batch.set_all_boards_speed(40.0, 2).await;
        assert_eq!(results.len(), 6);
        assert!(results.values().all(|ok| *ok));
        for log in &logs {
            assert_eq!(log.lock().unwrap().len(), 1);
        }

        let stats = batch.statistics();
        assert_eq!(stats.total_commands, 6);
        assert_eq!(stats.success_commands, 6);
    }

    #[tokio::test]
    async fn test_three_board_scenario_mixed_outcomes() {
        // Board 1 behaves, board 2 is unreachable, board 3 corrupts
        // response CRCs.
        let (addr_ok, _log_ok) = spawn_mock_board(MockReply::Ok).await;
        let (addr_bad, _log_bad) = spawn_mock_board(MockReply::CorruptCrc).await;
        let configs = vec![config_for(addr_ok), refused_config().await, config_for(addr_bad)];
        let mut batch = BatchController::new(configs).unwrap();

        let connects = batch.connect_all(DEFAULT_MAX_WORKERS).await;
        assert_eq!(
            connects,
            BTreeMap::from([(1, true), (2, false), (3, true)])
        );
        assert!(batch.statistics().failed_boards >= 1);

        let results = batch.set_all_boards_speed(50.0, DEFAULT_MAX_WORKERS).await;
        assert_eq!(
            results,
            BTreeMap::from([(1, true), (2, false), (3, false)])
        );

        let stats = batch.statistics();
        assert_eq!(stats.total_commands, 3);
        assert_eq!(stats.success_commands, 1);
        assert_eq!(stats.failed_commands, 2);
    }

    #[tokio::test]
    async fn test_repeated_connect_all_refreshes_board_counts() {
        let (addr, _log) = spawn_mock_board(MockReply::Ok).await;
        let mut batch =
            BatchController::new(vec![config_for(addr), refused_config().await]).unwrap();

        batch.connect_all(DEFAULT_MAX_WORKERS).await;
        batch.connect_all(DEFAULT_MAX_WORKERS).await;

        // Counts reflect the latest call, not an accumulation.
        let stats = batch.statistics();
        assert_eq!(stats.connected_boards, 1);
        assert_eq!(stats.failed_boards, 1);
    }

    #[tokio::test]
    async fn test_single_board_passthrough_validates_index() {
        let (addr, log) = spawn_mock_board(MockReply::Ok).await;
        let mut batch = BatchController::new(vec![config_for(addr)]).unwrap();
        batch.connect_all(DEFAULT_MAX_WORKERS).await;

        assert!(!batch.set_board_speed_individual(5, &[50.0; 16]).await);
        assert!(log.lock().unwrap().is_empty());

        assert!(batch.set_board_speed_individual(0, &[50.0; 16]).await);
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(batch.statistics().total_commands, 2);
    }

    #[tokio::test]
    async fn test_stop_all_boards_writes_zero_pwm() {
        let (addr, log) = spawn_mock_board(MockReply::Ok).await;
        let mut batch = BatchController::new(vec![config_for(addr)]).unwrap();
        batch.connect_all(DEFAULT_MAX_WORKERS).await;

        let results = batch.stop_all_boards(DEFAULT_MAX_WORKERS).await;
        assert_eq!(results, BTreeMap::from([(1, true)]));

        let frames = log.lock().unwrap();
        let request = &frames[0];
        assert_eq!(request[1], frame::FUNC_WRITE_MULTIPLE);
        for i in 0..16 {
            assert_eq!(&request[7 + i * 2..9 + i * 2], &[0x00, 0x00]);
        }
    }

    #[tokio::test]
    async fn test_status_snapshots_are_board_ordered() {
        let (addr, _log) = spawn_mock_board(MockReply::Ok).await;
        let mut batch =
            BatchController::new(vec![config_for(addr), refused_config().await]).unwrap();
        batch.connect_all(DEFAULT_MAX_WORKERS).await;

        let statuses = batch.all_status().await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].board_id, 1);
        assert_eq!(statuses[1].board_id, 2);
        assert!(statuses[0].is_connected);
        assert!(!statuses[1].is_connected);
        assert_eq!(statuses[0].fan_count, 16);

        assert!(batch.board_status(9).await.is_none());
    }
}
