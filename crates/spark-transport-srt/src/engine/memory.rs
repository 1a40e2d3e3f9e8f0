//! 进程内确定性传输引擎。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 在没有真实 SRT 协议栈的环境中驱动套接字层的全部契约：临时端口分配、backlog、
//!   握手延迟、握手失败注入、不可恢复故障、自连接模拟；
//! - 每个 [`MemoryEngine`] 实例持有独立的端口表，测试之间互不干扰，不存在进程级全局状态。
//!
//! ## 逻辑（How）
//! - 每条连接由两条定长环形缓冲区（`Pipe`）组成，读写在锁内拷贝、锁外唤醒，
//!   稳态读写不做任何堆分配；
//! - 监听句柄以有界 `mpsc` 作为 backlog，`connect` 在入队成功时即视为握手完成，
//!   与内核 TCP 的“已完成队列”语义一致；
//! - `payloadsize` 选项限制单次 `poll_send` 接受的字节数，用于模拟按包切分的短写。
//!
//! ## 注意事项（Trade-offs）
//! - 端口表只按端口号索引，同一端口不能同时绑定 IPv4 与 IPv6 监听；
//! - 地址中的作用域原样回显，不参与路由匹配。

use super::{EngineConnection, EngineListener, ShutdownDirection, TransportEngine};
use crate::addr::SrtAddr;
use crate::options::Options;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::{self, IoSlice};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::time::Instant;

const EPHEMERAL_FIRST: u16 = 49152;
const EPHEMERAL_LAST: u16 = 65535;

/// 引擎识别的选项；数值类选项必须能解析为正整数。
const NUMERIC_OPTIONS: &[&str] = &["payloadsize", "latency", "maxbw", "rcvbuf", "sndbuf"];
const TEXT_OPTIONS: &[&str] = &["passphrase", "streamid"];

/// 内存引擎的可调参数。
#[derive(Clone, Debug)]
pub struct MemoryEngineConfig {
    buffer_capacity: usize,
    backlog: usize,
    handshake_delay: Duration,
    allow_self_connect: bool,
    strict_options: bool,
}

impl Default for MemoryEngineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 64 * 1024,
            backlog: 128,
            handshake_delay: Duration::ZERO,
            allow_self_connect: false,
            strict_options: true,
        }
    }
}

impl MemoryEngineConfig {
    /// 每个方向环形缓冲区的容量（字节，至少为 1）。
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    /// 监听 backlog 深度（至少为 1）。
    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog.max(1);
        self
    }

    /// 每次 `connect` 在入队前等待的时长，用于模拟握手往返。
    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    /// 目标端口无人监听且空闲时，允许连接绑定到同一端口并与自身相连。
    pub fn with_self_connect(mut self, allow: bool) -> Self {
        self.allow_self_connect = allow;
        self
    }

    /// 关闭后，未识别的选项被忽略而不是报错。
    pub fn with_strict_options(mut self, strict: bool) -> Self {
        self.strict_options = strict;
        self
    }
}

/// 进程内引擎句柄，克隆体共享同一端口表。
#[derive(Clone, Debug)]
pub struct MemoryEngine {
    state: Arc<EngineState>,
}

#[derive(Debug)]
struct EngineState {
    config: MemoryEngineConfig,
    ports: Mutex<PortTable>,
    shutdown: watch::Sender<bool>,
    handshake_failures: AtomicUsize,
    next_listener_id: AtomicU64,
}

#[derive(Debug)]
struct PortTable {
    listeners: HashMap<u16, ListenerEntry>,
    in_use: HashSet<u16>,
    next_ephemeral: u16,
}

#[derive(Debug)]
struct ListenerEntry {
    id: u64,
    ip: Option<IpAddr>,
    queue: mpsc::Sender<MemoryConnection>,
    closed: watch::Receiver<bool>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_config(MemoryEngineConfig::default())
    }

    pub fn with_config(config: MemoryEngineConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(EngineState {
                config,
                ports: Mutex::new(PortTable {
                    listeners: HashMap::new(),
                    in_use: HashSet::new(),
                    next_ephemeral: EPHEMERAL_FIRST,
                }),
                shutdown,
                handshake_failures: AtomicUsize::new(0),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &MemoryEngineConfig {
        &self.state.config
    }

    /// 让接下来的 `count` 次 `accept` 以 `ConnectionAborted` 失败，并丢弃对应的入站连接。
    pub fn fail_next_handshakes(&self, count: usize) {
        self.state
            .handshake_failures
            .fetch_add(count, Ordering::AcqRel);
    }

    /// 模拟引擎级不可恢复故障：所有等待中与后续的 `accept`、`listen`、`connect` 均失败。
    pub fn shutdown(&self) {
        self.state.shutdown.send_replace(true);
    }

    /// 当前被监听或连接占用的端口数量。
    pub fn ports_in_use(&self) -> usize {
        self.state.ports.lock().in_use.len()
    }
}

impl EngineState {
    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn take_handshake_failure(&self) -> bool {
        self.handshake_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }

    fn validate_options(&self, options: &Options) -> io::Result<Option<usize>> {
        let mut payload = None;
        for (key, value) in options.iter() {
            if NUMERIC_OPTIONS.contains(&key) {
                let parsed = value.parse::<usize>().ok().filter(|parsed| *parsed > 0);
                match parsed {
                    Some(parsed) if key == "payloadsize" => payload = Some(parsed),
                    Some(_) => {}
                    None => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("invalid value {value:?} for option {key}"),
                        ));
                    }
                }
            } else if !TEXT_OPTIONS.contains(&key) && self.config.strict_options {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unknown option {key}"),
                ));
            }
        }
        Ok(payload)
    }
}

impl PortTable {
    fn allocate(&mut self, requested: u16) -> io::Result<u16> {
        if requested != 0 {
            if !self.in_use.insert(requested) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("port {requested} already in use"),
                ));
            }
            return Ok(requested);
        }
        let span = usize::from(EPHEMERAL_LAST - EPHEMERAL_FIRST) + 1;
        for _ in 0..span {
            let candidate = self.next_ephemeral;
            self.next_ephemeral = if candidate == EPHEMERAL_LAST {
                EPHEMERAL_FIRST
            } else {
                candidate + 1
            };
            if self.in_use.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "ephemeral ports exhausted",
        ))
    }
}

fn engine_shut_down() -> io::Error {
    io::Error::other("memory engine shut down")
}

fn listener_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener closed")
}

/// 将未指定地址映射到对应协议族的回环地址。
fn routable_ip(ip: Option<IpAddr>) -> IpAddr {
    match ip {
        None => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Some(IpAddr::V4(v4)) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Some(IpAddr::V6(v6)) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        Some(ip) => ip,
    }
}

fn endpoint(ip: IpAddr, port: u16, zone: Option<&str>) -> SrtAddr {
    let addr = SrtAddr::new(Some(ip), port);
    match zone {
        Some(zone) => addr.clone().with_zone(zone).unwrap_or(addr),
        None => addr,
    }
}

#[async_trait]
impl TransportEngine for MemoryEngine {
    async fn listen(
        &self,
        addr: &SrtAddr,
        options: &Options,
    ) -> io::Result<Box<dyn EngineListener>> {
        self.state.validate_options(options)?;
        if self.state.is_shut_down() {
            return Err(engine_shut_down());
        }
        let (tx, rx) = mpsc::channel(self.state.config.backlog);
        let (closed, closed_rx) = watch::channel(false);
        let id = self.state.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let port = {
            let mut ports = self.state.ports.lock();
            let port = ports.allocate(addr.port())?;
            ports.listeners.insert(
                port,
                ListenerEntry {
                    id,
                    ip: addr.ip(),
                    queue: tx,
                    closed: closed_rx,
                },
            );
            port
        };
        Ok(Box::new(MemoryListener {
            lease: PortLease::new(Arc::clone(&self.state), port),
            id,
            local: addr.with_port(port),
            queue: AsyncMutex::new(rx),
            closed,
        }))
    }

    async fn connect(
        &self,
        addr: &SrtAddr,
        options: &Options,
        deadline: Option<Instant>,
    ) -> io::Result<Box<dyn EngineConnection>> {
        let payload_limit = self.state.validate_options(options)?.unwrap_or(usize::MAX);
        if self.state.is_shut_down() {
            return Err(engine_shut_down());
        }

        let delay = self.state.config.handshake_delay;
        if !delay.is_zero() {
            let ready_at = Instant::now() + delay;
            match deadline {
                Some(deadline) if deadline < ready_at => {
                    tokio::time::sleep_until(deadline).await;
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "handshake timed out",
                    ));
                }
                _ => tokio::time::sleep_until(ready_at).await,
            }
        }

        let ip = routable_ip(addr.ip());
        let remote = endpoint(ip, addr.port(), addr.zone());
        let capacity = self.state.config.buffer_capacity;

        let (client, server, queue) = {
            let mut ports = self.state.ports.lock();
            let target = ports
                .listeners
                .get(&addr.port())
                .filter(|entry| entry.ip.is_none_or(|bound| bound.is_unspecified() || bound == ip))
                .map(|entry| (entry.queue.clone(), entry.closed.clone()));
            match target {
                Some(queue) => {
                    let local_port = ports.allocate(0)?;
                    let local = endpoint(ip, local_port, addr.zone());
                    let outbound = Pipe::new(capacity);
                    let inbound = Pipe::new(capacity);
                    let client = MemoryConnection {
                        rx: Arc::clone(&inbound),
                        tx: Arc::clone(&outbound),
                        local: local.clone(),
                        remote: remote.clone(),
                        payload_limit,
                        lease: Some(PortLease::new(Arc::clone(&self.state), local_port)),
                        closed: AtomicBool::new(false),
                    };
                    let server = MemoryConnection {
                        rx: outbound,
                        tx: inbound,
                        local: remote,
                        remote: local,
                        payload_limit: usize::MAX,
                        lease: None,
                        closed: AtomicBool::new(false),
                    };
                    (client, server, queue)
                }
                None if self.state.config.allow_self_connect
                    && !ports.in_use.contains(&addr.port())
                    && addr.port() != 0 =>
                {
                    let port = ports.allocate(addr.port())?;
                    let looped = Pipe::new(capacity);
                    return Ok(Box::new(MemoryConnection {
                        rx: Arc::clone(&looped),
                        tx: looped,
                        local: remote.clone(),
                        remote,
                        payload_limit,
                        lease: Some(PortLease::new(Arc::clone(&self.state), port)),
                        closed: AtomicBool::new(false),
                    }));
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("connection refused by {remote}"),
                    ));
                }
            }
        };

        let (queue, mut listener_closed) = queue;
        // 监听器关闭后，等待 backlog 空位的建连立即失败。
        let enqueue = async {
            tokio::select! {
                biased;
                _ = listener_closed.wait_for(|closed| *closed) => Err(()),
                sent = queue.send(server) => sent.map_err(|_| ()),
            }
        };
        let enqueued = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, enqueue).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "listener backlog full",
                    ));
                }
            },
            None => enqueue.await,
        };
        match enqueued {
            Ok(()) => Ok(Box::new(client)),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "listener closed during handshake",
            )),
        }
    }
}

/// 端口占用凭证，释放时归还端口。
#[derive(Debug)]
struct PortLease {
    state: Arc<EngineState>,
    port: u16,
    released: AtomicBool,
}

impl PortLease {
    fn new(state: Arc<EngineState>, port: u16) -> Self {
        Self {
            state,
            port,
            released: AtomicBool::new(false),
        }
    }

    fn release(&self, listener_id: Option<u64>) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut ports = self.state.ports.lock();
        if let Some(id) = listener_id
            && ports.listeners.get(&self.port).is_some_and(|entry| entry.id == id)
        {
            ports.listeners.remove(&self.port);
        }
        ports.in_use.remove(&self.port);
    }
}

/// 内存引擎的监听句柄。
#[derive(Debug)]
pub struct MemoryListener {
    lease: PortLease,
    id: u64,
    local: SrtAddr,
    queue: AsyncMutex<mpsc::Receiver<MemoryConnection>>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl EngineListener for MemoryListener {
    fn local_addr(&self) -> io::Result<SrtAddr> {
        Ok(self.local.clone())
    }

    async fn accept(&self) -> io::Result<Box<dyn EngineConnection>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(listener_closed());
        }
        let mut shutdown = self.lease.state.shutdown.subscribe();
        let mut queue = tokio::select! {
            biased;
            _ = shutdown.wait_for(|down| *down) => return Err(engine_shut_down()),
            _ = closed.wait_for(|closed| *closed) => return Err(listener_closed()),
            guard = self.queue.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|down| *down) => Err(engine_shut_down()),
            _ = closed.wait_for(|closed| *closed) => Err(listener_closed()),
            conn = queue.recv() => match conn {
                Some(conn) if self.lease.state.take_handshake_failure() => {
                    conn.close_pipes();
                    Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "handshake abandoned",
                    ))
                }
                Some(conn) => Ok(Box::new(conn)),
                None => Err(listener_closed()),
            },
        }
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        self.lease.release(Some(self.id));
        // 正在 accept 的调用持有队列锁时，由它观察到关闭标志后自行退出；
        // 否则在此关闭接收端并丢弃尚未交付的连接，对端随即读到流结束。
        if let Ok(mut queue) = self.queue.try_lock() {
            queue.close();
            while queue.try_recv().is_ok() {}
        }
        Ok(())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.lease.release(Some(self.id));
    }
}

/// 内存引擎的连接句柄。
#[derive(Debug)]
pub struct MemoryConnection {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    local: SrtAddr,
    remote: SrtAddr,
    payload_limit: usize,
    lease: Option<PortLease>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn close_pipes(&self) {
        self.tx.close_write();
        self.rx.close_read();
    }
}

impl EngineConnection for MemoryConnection {
    fn local_addr(&self) -> io::Result<SrtAddr> {
        Ok(self.local.clone())
    }

    fn remote_addr(&self) -> io::Result<SrtAddr> {
        Ok(self.remote.clone())
    }

    fn poll_recv(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        self.rx.poll_read(cx, buf)
    }

    fn poll_send(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.tx
            .poll_write(cx, &[IoSlice::new(buf)], self.payload_limit)
    }

    fn poll_send_vectored(
        &self,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.tx.poll_write(cx, bufs, self.payload_limit)
    }

    fn is_send_vectored(&self) -> bool {
        true
    }

    fn shutdown(&self, direction: ShutdownDirection) -> io::Result<()> {
        match direction {
            ShutdownDirection::Read => self.rx.close_read(),
            ShutdownDirection::Write => self.tx.close_write(),
            ShutdownDirection::Both => self.close_pipes(),
        }
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_pipes();
            if let Some(lease) = &self.lease {
                lease.release(None);
            }
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let _ = EngineConnection::close(self);
    }
}

/// 单向定长环形缓冲区。
#[derive(Debug)]
struct Pipe {
    state: Mutex<PipeState>,
}

#[derive(Debug)]
struct PipeState {
    buf: Box<[u8]>,
    head: usize,
    len: usize,
    reader: Option<Waker>,
    writer: Option<Waker>,
    write_closed: bool,
    read_closed: bool,
}

fn register(slot: &mut Option<Waker>, waker: &Waker) {
    match slot {
        Some(existing) if existing.will_wake(waker) => {}
        _ => *slot = Some(waker.clone()),
    }
}

impl Pipe {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PipeState {
                buf: vec![0; capacity].into_boxed_slice(),
                head: 0,
                len: 0,
                reader: None,
                writer: None,
                write_closed: false,
                read_closed: false,
            }),
        })
    }

    fn poll_read(&self, cx: &mut Context<'_>, out: &mut [u8]) -> Poll<io::Result<usize>> {
        if out.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut state = self.state.lock();
        if state.read_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "read side closed",
            )));
        }
        if state.len == 0 {
            if state.write_closed {
                return Poll::Ready(Ok(0));
            }
            register(&mut state.reader, cx.waker());
            return Poll::Pending;
        }

        let capacity = state.buf.len();
        let count = out.len().min(state.len);
        let first = count.min(capacity - state.head);
        let head = state.head;
        out[..first].copy_from_slice(&state.buf[head..head + first]);
        out[first..count].copy_from_slice(&state.buf[..count - first]);
        state.head = (head + count) % capacity;
        state.len -= count;

        let writer = state.writer.take();
        drop(state);
        if let Some(writer) = writer {
            writer.wake();
        }
        Poll::Ready(Ok(count))
    }

    fn poll_write(
        &self,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
        limit: usize,
    ) -> Poll<io::Result<usize>> {
        let requested = bufs.iter().map(|buf| buf.len()).sum::<usize>();
        if requested == 0 {
            return Poll::Ready(Ok(0));
        }
        let mut state = self.state.lock();
        if state.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "write side closed",
            )));
        }
        if state.read_closed {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        let capacity = state.buf.len();
        let space = capacity - state.len;
        if space == 0 {
            register(&mut state.writer, cx.waker());
            return Poll::Pending;
        }

        let mut budget = space.min(limit).min(requested);
        let mut written = 0;
        for buf in bufs {
            if budget == 0 {
                break;
            }
            let mut chunk = &buf[..buf.len().min(budget)];
            budget -= chunk.len();
            written += chunk.len();
            while !chunk.is_empty() {
                let tail = (state.head + state.len) % capacity;
                let run = chunk.len().min(capacity - tail);
                state.buf[tail..tail + run].copy_from_slice(&chunk[..run]);
                state.len += run;
                chunk = &chunk[run..];
            }
        }

        let reader = state.reader.take();
        drop(state);
        if let Some(reader) = reader {
            reader.wake();
        }
        Poll::Ready(Ok(written))
    }

    fn close_write(&self) {
        self.close_with(|state| state.write_closed = true);
    }

    fn close_read(&self) {
        self.close_with(|state| state.read_closed = true);
    }

    fn close_with(&self, mark: impl FnOnce(&mut PipeState)) {
        let mut state = self.state.lock();
        mark(&mut state);
        let reader = state.reader.take();
        let writer = state.writer.take();
        drop(state);
        for waker in [reader, writer].into_iter().flatten() {
            waker.wake();
        }
    }
}
