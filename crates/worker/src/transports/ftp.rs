//! FTP/SFTP 文件上传
//!
//! 协议客户端都是阻塞实现，整个上传过程放在 `spawn_blocking` 中执行。

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Serialize;
use std::fs::File;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use scheduler_core::{
    config::FtpConfig, models::payload::FileProtocol, Channel, ExecutionMetadata,
    ExecutionResult, FtpPayload, ScheduleTask, TaskPayload, Transport,
};

/// 已建立连接的远程文件客户端
pub trait RemoteFileClient {
    /// 逐级创建目录，已存在时忽略
    fn create_dir_all(&mut self, dir: &str) -> anyhow::Result<()>;

    fn exists(&mut self, path: &str) -> anyhow::Result<bool>;

    /// 上传单个文件，返回写入的字节数
    fn upload(&mut self, local: &Path, remote: &str) -> anyhow::Result<u64>;

    fn close(&mut self);
}

/// 按协议建立连接
pub trait ClientConnector: Send + Sync {
    fn connect(
        &self,
        payload: &FtpPayload,
        timeout: Duration,
    ) -> anyhow::Result<Box<dyn RemoteFileClient>>;
}

/// 一次上传中的单个文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadItem {
    pub local: PathBuf,
    pub remote: String,
}

#[derive(Debug, Default, Serialize)]
struct UploadReport {
    uploaded: Vec<String>,
    skipped: Vec<String>,
    failed: Vec<FailedUpload>,
    #[serde(skip)]
    bytes: u64,
}

#[derive(Debug, Serialize)]
struct FailedUpload {
    file: String,
    error: String,
}

/// 计算上传清单
///
/// 含通配符时匹配到的每个文件上传到 `remote_path` 目录下；
/// 否则上传单个文件，`remote_path` 以 `/` 结尾时视为目录。
pub fn plan_uploads(payload: &FtpPayload) -> anyhow::Result<Vec<UploadItem>> {
    if payload.is_pattern() {
        let mut items = Vec::new();
        for entry in glob::glob(&payload.local_path)
            .with_context(|| format!("无效的文件匹配模式: {}", payload.local_path))?
        {
            let local = entry.context("读取匹配文件失败")?;
            if !local.is_file() {
                continue;
            }
            let remote = join_remote(&payload.remote_path, &file_name(&local));
            items.push(UploadItem { local, remote });
        }
        if items.is_empty() {
            return Err(anyhow!("没有匹配的本地文件: {}", payload.local_path));
        }
        return Ok(items);
    }

    let local = PathBuf::from(&payload.local_path);
    if !local.is_file() {
        return Err(anyhow!("本地文件不存在: {}", payload.local_path));
    }
    let remote = if payload.remote_path.ends_with('/') {
        join_remote(&payload.remote_path, &file_name(&local))
    } else {
        payload.remote_path.clone()
    };
    Ok(vec![UploadItem { local, remote }])
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

fn remote_parent(path: &str) -> Option<&str> {
    path.rsplit_once('/')
        .map(|(parent, _)| parent)
        .filter(|p| !p.is_empty())
}

fn upload_all(
    client: &mut dyn RemoteFileClient,
    payload: &FtpPayload,
    items: &[UploadItem],
) -> UploadReport {
    let mut report = UploadReport::default();

    if payload.create_remote_directory {
        let mut dirs: Vec<&str> = items.iter().filter_map(|i| remote_parent(&i.remote)).collect();
        dirs.dedup();
        for dir in dirs {
            if let Err(e) = client.create_dir_all(dir) {
                warn!(dir = dir, error = %e, "创建远程目录失败");
            }
        }
    }

    for item in items {
        let local_display = item.local.display().to_string();

        if !payload.overwrite_existing {
            match client.exists(&item.remote) {
                Ok(true) => {
                    info!(remote = %item.remote, "远程文件已存在，跳过上传");
                    report.skipped.push(local_display);
                    continue;
                }
                Ok(false) => {}
                Err(e) => warn!(remote = %item.remote, error = %e, "检查远程文件失败"),
            }
        }

        match client.upload(&item.local, &item.remote) {
            Ok(bytes) => {
                info!(local = %local_display, remote = %item.remote, bytes = bytes, "文件上传成功");
                report.bytes += bytes;
                if payload.delete_local_after_upload {
                    if let Err(e) = std::fs::remove_file(&item.local) {
                        warn!(local = %local_display, error = %e, "删除本地文件失败");
                    }
                }
                report.uploaded.push(local_display);
            }
            Err(e) => {
                warn!(local = %local_display, remote = %item.remote, error = %e, "文件上传失败");
                report.failed.push(FailedUpload {
                    file: local_display,
                    error: format!("{e:#}"),
                });
            }
        }
    }

    report
}

/// FTP/SFTP 传输
pub struct FtpTransport {
    connector: Arc<dyn ClientConnector>,
    config: FtpConfig,
}

impl FtpTransport {
    pub fn new(config: FtpConfig) -> Self {
        Self::with_connector(config, Arc::new(ProtocolConnector))
    }

    pub fn with_connector(config: FtpConfig, connector: Arc<dyn ClientConnector>) -> Self {
        Self { connector, config }
    }

    async fn transfer(&self, payload: &FtpPayload) -> ExecutionResult {
        let items = match plan_uploads(payload) {
            Ok(items) => items,
            Err(e) => return ExecutionResult::failure("FileNotFound", format!("{e:#}")),
        };

        let timeout = Duration::from_secs(
            payload
                .timeout_seconds
                .unwrap_or(self.config.default_timeout_seconds),
        );
        let connector = self.connector.clone();
        let owned = payload.clone();
        let protocol = payload.protocol;

        let joined = tokio::task::spawn_blocking(move || {
            let mut client = connector.connect(&owned, timeout)?;
            let report = upload_all(client.as_mut(), &owned, &items);
            client.close();
            Ok::<_, anyhow::Error>(report)
        })
        .await;

        let exception_type = match protocol {
            FileProtocol::Ftp => "FtpError",
            FileProtocol::Sftp => "SftpError",
        };
        let report = match joined {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                return ExecutionResult::failure(exception_type, format!("连接失败: {e:#}"))
            }
            Err(e) => {
                return ExecutionResult::failure(exception_type, format!("上传任务异常终止: {e}"))
            }
        };

        let metadata = ExecutionMetadata {
            files_transferred: Some(report.uploaded.len() as i32),
            bytes_transferred: Some(report.bytes as i64),
            details: serde_json::to_value(&report).ok(),
            ..Default::default()
        };

        if report.failed.is_empty() {
            ExecutionResult::success(metadata)
        } else {
            let message = format!(
                "{}个文件上传失败: {}",
                report.failed.len(),
                report
                    .failed
                    .iter()
                    .map(|f| format!("{} ({})", f.file, f.error))
                    .collect::<Vec<_>>()
                    .join("; ")
            );
            ExecutionResult::failure(exception_type, message).with_metadata(metadata)
        }
    }
}

#[async_trait]
impl Transport for FtpTransport {
    fn channel(&self) -> Channel {
        Channel::Ftp
    }

    async fn execute(&self, task: &ScheduleTask) -> ExecutionResult {
        match &task.payload {
            TaskPayload::Ftp(payload) => self.transfer(payload).await,
            other => ExecutionResult::failure(
                "PayloadMismatch",
                format!("文件传输收到{}通道的任务", other.channel()),
            ),
        }
    }
}

/// 默认连接器：FTP 使用 suppaftp，SFTP 使用 ssh2
pub struct ProtocolConnector;

impl ClientConnector for ProtocolConnector {
    fn connect(
        &self,
        payload: &FtpPayload,
        timeout: Duration,
    ) -> anyhow::Result<Box<dyn RemoteFileClient>> {
        let address = (payload.host.as_str(), payload.effective_port())
            .to_socket_addrs()
            .with_context(|| format!("解析主机地址失败: {}", payload.host))?
            .next()
            .ok_or_else(|| anyhow!("主机地址无法解析: {}", payload.host))?;
        let username = payload.username.clone().unwrap_or_else(|| "anonymous".to_string());
        let password = payload.password.clone().unwrap_or_default();

        match payload.protocol {
            FileProtocol::Ftp => {
                let mut stream = suppaftp::FtpStream::connect_timeout(address, timeout)
                    .context("连接FTP服务器失败")?;
                stream
                    .login(&username, &password)
                    .context("FTP登录失败")?;
                let mode = if payload.passive {
                    suppaftp::Mode::Passive
                } else {
                    suppaftp::Mode::Active
                };
                stream.set_mode(mode);
                stream
                    .transfer_type(suppaftp::types::FileType::Binary)
                    .context("设置二进制传输模式失败")?;
                Ok(Box::new(FtpClient { stream }))
            }
            FileProtocol::Sftp => {
                let tcp = TcpStream::connect_timeout(&address, timeout)
                    .context("连接SFTP服务器失败")?;
                let mut session = ssh2::Session::new().context("创建SSH会话失败")?;
                session.set_tcp_stream(tcp);
                session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
                session.handshake().context("SSH握手失败")?;
                session
                    .userauth_password(&username, &password)
                    .context("SFTP认证失败")?;
                let sftp = session.sftp().context("打开SFTP通道失败")?;
                Ok(Box::new(SftpClient {
                    _session: session,
                    sftp,
                }))
            }
        }
    }
}

struct FtpClient {
    stream: suppaftp::FtpStream,
}

impl RemoteFileClient for FtpClient {
    fn create_dir_all(&mut self, dir: &str) -> anyhow::Result<()> {
        let mut current = String::new();
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            if dir.starts_with('/') || !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            // 目录已存在时服务器返回错误，忽略
            let _ = self.stream.mkdir(&current);
        }
        Ok(())
    }

    fn exists(&mut self, path: &str) -> anyhow::Result<bool> {
        Ok(self.stream.size(path).is_ok())
    }

    fn upload(&mut self, local: &Path, remote: &str) -> anyhow::Result<u64> {
        let mut file = File::open(local)
            .with_context(|| format!("打开本地文件失败: {}", local.display()))?;
        let bytes = self
            .stream
            .put_file(remote, &mut file)
            .with_context(|| format!("上传到 {remote} 失败"))?;
        Ok(bytes)
    }

    fn close(&mut self) {
        if let Err(e) = self.stream.quit() {
            warn!(error = %e, "关闭FTP连接失败");
        }
    }
}

struct SftpClient {
    _session: ssh2::Session,
    sftp: ssh2::Sftp,
}

impl RemoteFileClient for SftpClient {
    fn create_dir_all(&mut self, dir: &str) -> anyhow::Result<()> {
        let mut current = PathBuf::new();
        if dir.starts_with('/') {
            current.push("/");
        }
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            current.push(part);
            if self.sftp.stat(&current).is_err() {
                self.sftp
                    .mkdir(&current, 0o755)
                    .with_context(|| format!("创建远程目录失败: {}", current.display()))?;
            }
        }
        Ok(())
    }

    fn exists(&mut self, path: &str) -> anyhow::Result<bool> {
        Ok(self.sftp.stat(Path::new(path)).is_ok())
    }

    fn upload(&mut self, local: &Path, remote: &str) -> anyhow::Result<u64> {
        let mut source = File::open(local)
            .with_context(|| format!("打开本地文件失败: {}", local.display()))?;
        let mut target = self
            .sftp
            .create(Path::new(remote))
            .with_context(|| format!("创建远程文件失败: {remote}"))?;
        let bytes = std::io::copy(&mut source, &mut target)
            .with_context(|| format!("上传到 {remote} 失败"))?;
        Ok(bytes)
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeServer {
        files: Mutex<HashMap<String, Vec<u8>>>,
        dirs: Mutex<HashSet<String>>,
        fail_on: Mutex<HashSet<String>>,
        refuse_connection: bool,
    }

    struct FakeClient {
        server: Arc<FakeServer>,
    }

    impl RemoteFileClient for FakeClient {
        fn create_dir_all(&mut self, dir: &str) -> anyhow::Result<()> {
            self.server.dirs.lock().unwrap().insert(dir.to_string());
            Ok(())
        }

        fn exists(&mut self, path: &str) -> anyhow::Result<bool> {
            Ok(self.server.files.lock().unwrap().contains_key(path))
        }

        fn upload(&mut self, local: &Path, remote: &str) -> anyhow::Result<u64> {
            if self.server.fail_on.lock().unwrap().contains(remote) {
                return Err(anyhow!("550 permission denied"));
            }
            let content = std::fs::read(local)?;
            let len = content.len() as u64;
            self.server
                .files
                .lock()
                .unwrap()
                .insert(remote.to_string(), content);
            Ok(len)
        }

        fn close(&mut self) {}
    }

    struct FakeConnector(Arc<FakeServer>);

    impl ClientConnector for FakeConnector {
        fn connect(
            &self,
            _payload: &FtpPayload,
            _timeout: Duration,
        ) -> anyhow::Result<Box<dyn RemoteFileClient>> {
            if self.0.refuse_connection {
                return Err(anyhow!("connection refused"));
            }
            Ok(Box::new(FakeClient {
                server: self.0.clone(),
            }))
        }
    }

    fn payload(local: &Path, remote: &str) -> FtpPayload {
        FtpPayload {
            host: "files.local".to_string(),
            port: None,
            username: Some("u".to_string()),
            password: Some("p".to_string()),
            protocol: FileProtocol::Sftp,
            passive: true,
            timeout_seconds: Some(5),
            local_path: local.to_string_lossy().into_owned(),
            remote_path: remote.to_string(),
            overwrite_existing: true,
            create_remote_directory: true,
            delete_local_after_upload: false,
        }
    }

    fn transport(server: &Arc<FakeServer>) -> FtpTransport {
        FtpTransport::with_connector(FtpConfig::default(), Arc::new(FakeConnector(server.clone())))
    }

    #[test]
    fn test_plan_single_file_and_directory_target() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "a").unwrap();

        let items = plan_uploads(&payload(&file, "/upload/renamed.txt")).unwrap();
        assert_eq!(items[0].remote, "/upload/renamed.txt");

        let items = plan_uploads(&payload(&file, "/upload/")).unwrap();
        assert_eq!(items[0].remote, "/upload/a.txt");

        assert!(plan_uploads(&payload(&dir.path().join("missing.txt"), "/x")).is_err());
    }

    #[tokio::test]
    async fn test_batch_upload_with_pattern_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.csv"), "1234").unwrap();
        std::fs::write(dir.path().join("b.csv"), "56").unwrap();
        std::fs::write(dir.path().join("c.log"), "ignored").unwrap();

        let server = Arc::new(FakeServer::default());
        let mut batch = payload(&dir.path().join("*.csv"), "/inbox");
        batch.delete_local_after_upload = true;

        let result = transport(&server).transfer(&batch).await;
        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.metadata.files_transferred, Some(2));
        assert_eq!(result.metadata.bytes_transferred, Some(6));

        let files = server.files.lock().unwrap();
        assert!(files.contains_key("/inbox/a.csv"));
        assert!(files.contains_key("/inbox/b.csv"));
        assert!(server.dirs.lock().unwrap().contains("/inbox"));
        assert!(!dir.path().join("a.csv").exists());
        assert!(dir.path().join("c.log").exists());
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_local_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.txt"), "ok").unwrap();
        std::fs::write(dir.path().join("bad.txt"), "bad").unwrap();

        let server = Arc::new(FakeServer::default());
        server
            .fail_on
            .lock()
            .unwrap()
            .insert("/out/bad.txt".to_string());
        let mut batch = payload(&dir.path().join("*.txt"), "/out");
        batch.delete_local_after_upload = true;

        let result = transport(&server).transfer(&batch).await;
        assert!(!result.success);
        assert_eq!(result.exception_type.as_deref(), Some("SftpError"));
        assert!(result.error_message.unwrap().contains("bad.txt"));
        assert_eq!(result.metadata.files_transferred, Some(1));
        assert!(dir.path().join("bad.txt").exists());
        assert!(!dir.path().join("ok.txt").exists());
    }

    #[tokio::test]
    async fn test_skip_existing_when_overwrite_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("report.txt");
        std::fs::write(&file, "new").unwrap();

        let server = Arc::new(FakeServer::default());
        server
            .files
            .lock()
            .unwrap()
            .insert("/r/report.txt".to_string(), b"old".to_vec());
        let mut single = payload(&file, "/r/report.txt");
        single.overwrite_existing = false;

        let result = transport(&server).transfer(&single).await;
        assert!(result.success);
        assert_eq!(result.metadata.files_transferred, Some(0));
        assert_eq!(server.files.lock().unwrap()["/r/report.txt"], b"old".to_vec());
    }

    #[tokio::test]
    async fn test_connection_and_missing_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.bin");
        std::fs::write(&file, [0u8; 3]).unwrap();

        let server = Arc::new(FakeServer {
            refuse_connection: true,
            ..Default::default()
        });
        let mut ftp = payload(&file, "/x.bin");
        ftp.protocol = FileProtocol::Ftp;
        let result = transport(&server).transfer(&ftp).await;
        assert_eq!(result.exception_type.as_deref(), Some("FtpError"));

        let nothing = payload(&dir.path().join("*.none"), "/inbox");
        let result = transport(&server).transfer(&nothing).await;
        assert_eq!(result.exception_type.as_deref(), Some("FileNotFound"));
    }
}
