//! External soft-decision LDPC decoder processes.
//!
//! A helper is spawned per MODCOD and frame size as
//! `<tool> --trials N --batch-size B --modcod M [--shortframes]`. It reads one signed byte per
//! codeword bit on stdin and writes the same amount of improved soft bits to stdout, in order.
//! Helpers may hold frames back until a batch is complete. Each helper has a writer and a reader
//! thread so the caller never blocks on a pipe.
use std::{
    collections::HashMap,
    io::{Read, Write},
    path::PathBuf,
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    thread::JoinHandle,
};

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info};

use crate::{Error, Result};

use super::Pls;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelperConfig {
    pub tool: PathBuf,
    pub max_trials: u32,
    /// Processes per MODCOD and frame size.
    pub helpers: usize,
    pub batch_size: usize,
}

/// A frame returned by a helper, or the reason it was lost.
#[derive(Debug)]
pub struct HelperOutput {
    pub seq: u64,
    pub pls: Pls,
    pub result: Result<Vec<i8>>,
    /// Set on the first loss from a running helper set, which is then torn down. Frames that
    /// were queued to the same set come back as errors with this unset.
    pub crashed: bool,
    generation: u64,
}

struct Job {
    seq: u64,
    pls: Pls,
    llrs: Vec<i8>,
}

fn as_bytes(llrs: &[i8]) -> Vec<u8> {
    llrs.iter().map(|v| *v as u8).collect()
}

/// Feed jobs to the helper and tell the reader what to expect.
fn writer_loop(
    generation: u64,
    mut stdin: ChildStdin,
    jobs: Receiver<Job>,
    expect: Sender<(u64, Pls, usize)>,
    results: Sender<HelperOutput>,
) {
    for job in jobs {
        let len = job.llrs.len();
        match stdin.write_all(&as_bytes(&job.llrs)).and_then(|_| stdin.flush()) {
            Ok(()) => {
                if expect.send((job.seq, job.pls, len)).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = results.send(HelperOutput {
                    seq: job.seq,
                    pls: job.pls,
                    result: Err(Error::Delegate(format!("write: {e}"))),
                    crashed: false,
                    generation,
                });
            }
        }
    }
}

fn reader_loop(
    generation: u64,
    mut stdout: ChildStdout,
    expect: Receiver<(u64, Pls, usize)>,
    results: Sender<HelperOutput>,
) {
    let mut buf = Vec::new();
    for (seq, pls, len) in expect {
        buf.resize(len, 0u8);
        let result = match stdout.read_exact(&mut buf) {
            Ok(()) => Ok(buf.iter().map(|b| *b as i8).collect()),
            Err(e) => Err(Error::Delegate(format!("read: {e}"))),
        };
        let out = HelperOutput {
            seq,
            pls,
            result,
            crashed: false,
            generation,
        };
        if results.send(out).is_err() {
            return;
        }
    }
}

struct Helper {
    child: Child,
    jobs: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl Helper {
    fn spawn(
        config: &HelperConfig,
        pls: Pls,
        generation: u64,
        results: Sender<HelperOutput>,
    ) -> Result<Self> {
        let mut cmd = Command::new(&config.tool);
        cmd.arg("--trials")
            .arg(config.max_trials.to_string())
            .arg("--batch-size")
            .arg(config.batch_size.to_string())
            .arg("--modcod")
            .arg(pls.modcod.to_string());
        if pls.short_frames {
            cmd.arg("--shortframes");
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Delegate(format!("spawn {}: {e}", config.tool.display())))?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(Error::Delegate("helper pipes unavailable".into()));
        };
        debug!(pid = child.id(), modcod = pls.modcod, short = pls.short_frames, "LDPC helper spawned");

        let (jobs_tx, jobs_rx) = unbounded();
        let (expect_tx, expect_rx) = unbounded();
        let writer_results = results.clone();
        let threads = vec![
            std::thread::spawn(move || {
                writer_loop(generation, stdin, jobs_rx, expect_tx, writer_results)
            }),
            std::thread::spawn(move || reader_loop(generation, stdout, expect_rx, results)),
        ];
        Ok(Helper {
            child,
            jobs: Some(jobs_tx),
            threads,
        })
    }
}

impl Drop for Helper {
    fn drop(&mut self) {
        self.jobs.take();
        if let Err(e) = self.child.kill() {
            debug!("LDPC helper {} already gone: {e}", self.child.id());
        }
        let _ = self.child.wait();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

struct HelperSet {
    procs: Vec<Helper>,
    next: usize,
    generation: u64,
}

/// Helper processes keyed by MODCOD and frame size, spawned on first use.
pub struct HelperPool {
    config: HelperConfig,
    sets: HashMap<(u8, bool), HelperSet>,
    results_tx: Sender<HelperOutput>,
    results_rx: Receiver<HelperOutput>,
    in_flight: usize,
    generation: u64,
}

impl HelperPool {
    pub fn new(config: HelperConfig) -> Self {
        let (results_tx, results_rx) = unbounded();
        HelperPool {
            config,
            sets: HashMap::default(),
            results_tx,
            results_rx,
            in_flight: 0,
            generation: 0,
        }
    }

    /// Frames submitted and not yet collected.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Hand a frame to the next helper of its MODCOD.
    pub fn submit(&mut self, seq: u64, pls: Pls, llrs: Vec<i8>) -> Result<()> {
        let key = (pls.modcod, pls.short_frames);
        if !self.sets.contains_key(&key) {
            info!(
                modcod = pls.modcod,
                short = pls.short_frames,
                helpers = self.config.helpers,
                "starting LDPC helpers"
            );
            self.generation += 1;
            let generation = self.generation;
            let procs = (0..self.config.helpers)
                .map(|_| Helper::spawn(&self.config, pls, generation, self.results_tx.clone()))
                .collect::<Result<Vec<_>>>()?;
            self.sets.insert(
                key,
                HelperSet {
                    procs,
                    next: 0,
                    generation,
                },
            );
        }
        let Some(set) = self.sets.get_mut(&key) else {
            return Err(Error::Delegate("helper set vanished".into()));
        };
        let i = set.next % set.procs.len().max(1);
        set.next = i + 1;
        let sender = set
            .procs
            .get(i)
            .and_then(|h| h.jobs.as_ref())
            .ok_or_else(|| Error::Delegate("no LDPC helper".into()))?;
        if sender.send(Job { seq, pls, llrs }).is_err() {
            error!(modcod = pls.modcod, "LDPC helper threads exited");
            // respawn on next use
            self.sets.remove(&key);
            return Err(Error::Delegate("helper threads exited".into()));
        }
        self.in_flight += 1;
        Ok(())
    }

    /// A finished frame, if any, without blocking.
    pub fn try_recv(&mut self) -> Option<HelperOutput> {
        let out = self.results_rx.try_recv().ok()?;
        Some(self.settle(out))
    }

    /// Block until a result arrives or `timeout` elapses.
    pub fn recv_timeout(&mut self, timeout: std::time::Duration) -> Option<HelperOutput> {
        let out = self.results_rx.recv_timeout(timeout).ok()?;
        Some(self.settle(out))
    }

    fn settle(&mut self, mut out: HelperOutput) -> HelperOutput {
        self.in_flight = self.in_flight.saturating_sub(1);
        if out.result.is_err() {
            let key = (out.pls.modcod, out.pls.short_frames);
            if self.sets.get(&key).is_some_and(|set| set.generation == out.generation) {
                error!(modcod = out.pls.modcod, generation = out.generation, "LDPC helper lost");
                // replaced on next use
                self.sets.remove(&key);
                out.crashed = true;
            }
        }
        out
    }

    pub fn has_results(&self) -> bool {
        !self.results_rx.is_empty()
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use std::{os::unix::fs::PermissionsExt, time::Duration};

    /// A helper that echoes its input, after checking the arguments it was given.
    fn echo_tool(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("ldpc_tool");
        std::fs::write(
            &path,
            "#!/bin/sh\n[ \"$1\" = --trials ] && [ \"$3\" = --batch-size ] && [ \"$5\" = --modcod ] || exit 3\nexec cat\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// A helper that returns one frame and exits the first time it runs, then behaves.
    pub(crate) fn crash_once_tool(dir: &tempfile::TempDir, frame_len: usize) -> PathBuf {
        let path = dir.path().join("ldpc_tool_crash_once");
        let marker = dir.path().join("launched");
        let script = format!(
            "#!/bin/sh\nif [ ! -e '{m}' ]; then\n  touch '{m}'\n  head -c {frame_len}\n  exit 0\nfi\nexec cat\n",
            m = marker.display()
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_round_trip_through_helper() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = HelperPool::new(HelperConfig {
            tool: echo_tool(&dir),
            max_trials: 8,
            helpers: 2,
            batch_size: 1,
        });
        let pls = Pls::new(4, true, false);
        let frame: Vec<i8> = (0..16200).map(|i| (i % 255) as i8).collect();
        pool.submit(1, pls, frame.clone()).unwrap();
        pool.submit(2, pls, frame.clone()).unwrap();
        assert_eq!(pool.in_flight(), 2);

        let mut seen = Vec::new();
        while seen.len() < 2 {
            let out = pool.recv_timeout(Duration::from_secs(10)).expect("helper result");
            assert_eq!(out.pls, pls);
            assert_eq!(out.result.unwrap(), frame);
            seen.push(out.seq);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_missing_tool_fails_submit() {
        let mut pool = HelperPool::new(HelperConfig {
            tool: PathBuf::from("/nonexistent/ldpc_tool"),
            max_trials: 8,
            helpers: 1,
            batch_size: 1,
        });
        let err = pool.submit(0, Pls::new(4, false, false), vec![0; 64800]);
        assert!(matches!(err, Err(Error::Delegate(_))));
    }

    #[test]
    fn test_helper_crash_counts_once_and_respawns() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = HelperPool::new(HelperConfig {
            tool: crash_once_tool(&dir, 16200),
            max_trials: 8,
            helpers: 1,
            batch_size: 16,
        });
        let pls = Pls::new(4, true, false);
        let frame: Vec<i8> = (0..16200).map(|i| (i % 127) as i8).collect();
        for seq in 0..4 {
            pool.submit(seq, pls, frame.clone()).unwrap();
        }

        let mut outs: Vec<HelperOutput> = (0..4)
            .map(|_| pool.recv_timeout(Duration::from_secs(10)).expect("helper result"))
            .collect();
        outs.sort_by_key(|o| o.seq);
        assert_eq!(outs[0].result.as_ref().unwrap(), &frame);
        assert!(outs[1..].iter().all(|o| o.result.is_err()));
        assert_eq!(outs.iter().filter(|o| o.crashed).count(), 1);
        assert_eq!(pool.in_flight(), 0);

        // the replacement set is not torn down by anything left over from the first one
        for seq in 4..8 {
            pool.submit(seq, pls, frame.clone()).unwrap();
        }
        for _ in 4..8 {
            let out = pool.recv_timeout(Duration::from_secs(10)).expect("helper result");
            assert!(!out.crashed);
            assert_eq!(out.result.unwrap(), frame);
        }
    }
}
