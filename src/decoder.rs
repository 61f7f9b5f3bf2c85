use crate::config::{DecoderConfig, StreamConfig};
use crate::error::{SpawnError, StopTimeoutError};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

/// 解码器子进程句柄
///
/// 每个标识同一时刻只允许存在一个存活的句柄。停止是幂等的，
/// 子进程被回收后再次调用 `stop` 不做任何事。
pub struct DecoderHandle {
    identifier: String,
    child: Option<Child>,
    pid: Option<u32>,
    started_at: Instant,
}

/// 解码器 stderr 的惰性行序列，进程退出 (EOF) 后结束，不可重启
pub struct LineStream {
    reader: BufReader<ChildStderr>,
    buf: Vec<u8>,
}

impl LineStream {
    /// 读取下一行；EOF 或读错误时返回 None
    pub async fn next_line(&mut self) -> Option<String> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) => None,
            Ok(_) => {
                let line = String::from_utf8_lossy(&self.buf);
                Some(line.trim_end_matches(&['\r', '\n'][..]).to_string())
            }
            Err(e) => {
                warn!("Decoder stderr read failed: {}", e);
                None
            }
        }
    }
}

pub struct Decoder;

impl Decoder {
    /// 启动一路流的解码器进程
    ///
    /// # 错误处理
    /// - 可用内存不足时返回错误
    /// - 可执行文件不存在时返回错误
    /// - 进程在观察期内立即退出 (例如 URL 被拒绝) 时返回错误
    pub async fn start(
        cfg: &StreamConfig,
        settings: &DecoderConfig,
    ) -> Result<(DecoderHandle, LineStream), SpawnError> {
        // 1. 检查系统内存是否足够
        match sys_info::mem_info() {
            Ok(mem) => {
                if mem.avail < settings.min_free_memory_kb {
                    return Err(SpawnError::LowMemory {
                        available_kb: mem.avail,
                    });
                }
            }
            Err(e) => {
                // 无法获取内存信息时仅记录警告而不阻断流程
                warn!("Failed to check memory usage: {}", e);
            }
        }

        // 2. 构建命令，替换参数模板中的占位符
        let mut cmd = Command::new(&settings.binary);
        cmd.args(build_args(cfg, &settings.args));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // 独立进程组：终端 Ctrl+C 和 systemd 的 SIGTERM 只送达本进程，
        // 解码器由 stop 负责终止
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SpawnError::Launch {
            binary: settings.binary.clone(),
            source,
        })?;
        let pid = child.id();

        let stderr = child.stderr.take().ok_or(SpawnError::NoStderr)?;
        let mut lines = LineStream {
            reader: BufReader::new(stderr),
            buf: Vec::new(),
        };

        // 3. 短暂观察，捕获立即退出的进程
        if settings.startup_grace_ms > 0 {
            tokio::time::sleep(Duration::from_millis(settings.startup_grace_ms)).await;
        }
        if let Ok(Some(status)) = child.try_wait() {
            let mut last = None;
            let drain = async {
                while let Some(line) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        last = Some(line);
                    }
                }
            };
            let _ = tokio::time::timeout(Duration::from_millis(500), drain).await;
            let status = match last {
                Some(line) => format!("{status}: {line}"),
                None => status.to_string(),
            };
            return Err(SpawnError::ExitedEarly { status });
        }

        info!("Starting decoder for {} with PID: {:?}", cfg.identifier, pid);

        Ok((
            DecoderHandle {
                identifier: cfg.identifier.clone(),
                child: Some(child),
                pid,
                started_at: Instant::now(),
            },
            lines,
        ))
    }
}

fn build_args(cfg: &StreamConfig, template: &[String]) -> Vec<String> {
    let loudness = cfg.loudness_db.to_string();
    let silence_timeout = cfg.silence_timeout_secs.to_string();
    template
        .iter()
        .map(|arg| {
            arg.replace("{url}", &cfg.url)
                .replace("{loudness}", &loudness)
                .replace("{silence_timeout}", &silence_timeout)
        })
        .collect()
}

impl DecoderHandle {
    /// 存活进程的 PID；进程已自行退出时顺带回收，返回 None
    pub fn pid(&mut self) -> Option<u32> {
        if let Some(child) = self.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                info!("Decoder for {} exited on its own: {}", self.identifier, status);
                self.child = None;
            }
        }
        self.child.as_ref().and(self.pid)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 优雅停止：先发送 SIGTERM，超时后强制终止
    ///
    /// 无论是否超时，返回时进程都已退出并被回收。
    pub async fn stop(&mut self, timeout: Duration) -> Result<(), StopTimeoutError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        // 进程已自行退出，只需回收
        if let Ok(Some(status)) = child.try_wait() {
            debug!("Decoder for {} already exited: {}", self.identifier, status);
            return Ok(());
        }

        terminate(&mut child);

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!("Decoder for {} terminated ({}).", self.identifier, status);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Waiting on decoder for {} failed: {}", self.identifier, e);
                let _ = child.kill().await;
                Ok(())
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill decoder for {}: {}", self.identifier, e);
                }
                Err(StopTimeoutError {
                    pid: self.pid,
                    timeout,
                })
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    // 没有 SIGTERM，直接终止
    let _ = child.start_kill();
}
