//! Async client, on anything tokio can read and write.
//!
//! ```no_run
//! use hdlcarq::Addr;
//! use hdlcarq::r#async::ConnectionBuilder;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut con = ConnectionBuilder::serial(Addr::new("M0THC-1")?, "/dev/rfcomm0", 9600)?
//!     .extended(true)
//!     .connect(Addr::new("M0THC-2")?)
//!     .await?;
//! con.write(b"Hello\r").await?;
//! println!("{:?}", con.read().await?);
//! con.disconnect().await?;
//! # Ok(())
//! # }
//! ```
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Error, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::addr::Addr;
use crate::config::Config;
use crate::kiss::{self, KissDecoder};
use crate::link::Link;
use crate::pcap::{Direction, PcapWriter};
use crate::state::{Cause, Delivery, Event, Indication, LinkState, ReturnEvent};

/// How long to sleep when no timer is running.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Set up a connection, either way.
pub struct ConnectionBuilder<P> {
    me: Addr,
    port: P,
    config: Config,
    capture: Option<PathBuf>,
}

impl ConnectionBuilder<tokio_serial::SerialStream> {
    /// Builder for a KISS TNC on a serial port.
    pub fn serial(me: Addr, path: &str, baud: u32) -> Result<Self> {
        use tokio_serial::SerialPortBuilderExt;
        let port = tokio_serial::new(path, baud).open_native_async()?;
        Ok(Self::new(me, port))
    }
}

impl<P> ConnectionBuilder<P>
where
    P: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(me: Addr, port: P) -> Self {
        Self {
            me,
            port,
            config: Config::ax25(),
            capture: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Ask for modulus 128 when connecting, and accept it when asked.
    #[must_use]
    pub fn extended(mut self, ext: bool) -> Self {
        self.config.extended = ext;
        self
    }

    /// Write every frame sent and received to a new pcap file.
    #[must_use]
    pub fn capture(mut self, path: PathBuf) -> Self {
        self.capture = Some(path);
        self
    }

    fn build(self) -> Result<Client<P>> {
        let capture = match self.capture {
            Some(path) => Some(PcapWriter::create(path, self.config.flavour)?),
            None => None,
        };
        let (kiss_tx, mut kiss_rx) = mpsc::channel::<Vec<u8>>(10);
        // Unbounded, so the parser never waits on a client that is itself
        // waiting to hand the parser more bytes.
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            let mut decoder = KissDecoder::default();
            while let Some(bytes) = kiss_rx.recv().await {
                debug!("Got {} KISS bytes", bytes.len());
                decoder.push(&bytes);
                while let Some(frame) = decoder.next_frame() {
                    if frame_tx.send(frame).is_err() {
                        debug!("Client gone, KISS parser ending");
                        return;
                    }
                }
            }
            debug!("KISS parser ending");
        });
        Ok(Client {
            link: Link::ax25(self.config, self.me),
            port: self.port,
            kiss_tx: Some(kiss_tx),
            frame_rx,
            capture,
            eof: false,
            refused: None,
            incoming: VecDeque::new(),
        })
    }

    /// Connect to `peer`. Returns once connected, or fails if the peer
    /// refused or never answered.
    pub async fn connect(self, peer: Addr) -> Result<Client<P>> {
        let ext = self.config.extended;
        let mut cli = self.build()?;
        cli.link.set_peer(peer, vec![]);
        cli.actions(Event::Connect(ext)).await?;
        loop {
            cli.wait_event().await?;
            debug!("State after waiting: {:?}", cli.state());
            if cli.link.is_connected() {
                return Ok(cli);
            }
            if cli.link.is_disconnected() {
                return Err(Error::msg(format!(
                    "connection failed: {:?}",
                    cli.refused.unwrap_or(Cause::Timedout)
                )));
            }
        }
    }

    /// Wait for someone to connect to us.
    pub async fn accept(self) -> Result<Client<P>> {
        let mut cli = self.build()?;
        while !cli.link.is_connected() {
            cli.wait_event().await?;
        }
        info!("Accepted connection from {:?}", cli.link.peer());
        Ok(cli)
    }
}

/// An established (or once established) connection.
pub struct Client<P> {
    link: Link,
    port: P,

    /// None once the port has hit EOF.
    kiss_tx: Option<mpsc::Sender<Vec<u8>>>,
    frame_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    capture: Option<PcapWriter>,
    eof: bool,
    refused: Option<Cause>,
    incoming: VecDeque<u8>,
}

impl<P> Client<P>
where
    P: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    #[must_use]
    pub fn peer(&self) -> Option<&Addr> {
        self.link.peer()
    }

    /// Disconnect, and wait for the peer to confirm (or T1 to give up).
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.link.is_disconnected() {
            return Ok(());
        }
        self.actions(Event::Disconnect).await?;
        while !self.link.is_disconnected() {
            self.wait_event().await?;
        }
        self.flush_capture()
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.actions(Event::Data(None, data.to_vec())).await
    }

    /// Read data. An empty vec means the remote end disconnected.
    pub async fn read(&mut self) -> Result<Vec<u8>> {
        loop {
            if !self.incoming.is_empty() {
                return Ok(self.incoming.drain(..).collect());
            }
            if self.eof {
                return Ok(vec![]);
            }
            self.wait_event().await?;
        }
    }

    /// Wait for a frame, a timer, or more bytes from the port.
    async fn wait_event(&mut self) -> Result<()> {
        let sleep = self.link.next_timer_remaining().unwrap_or(IDLE_WAIT);
        let reading = self.kiss_tx.is_some();
        let mut buf = [0; 1024];
        tokio::select! {
            () = tokio::time::sleep(sleep) => {
                let ev = self.link.poll_timers();
                self.process(ev).await?;
            },
            frame = self.frame_rx.recv() => {
                let frame = frame.ok_or(Error::msg("port closed"))?;
                if let Some(c) = &mut self.capture {
                    c.write(&frame, Direction::Received)?;
                }
                let ev = self.link.deliver_frame(&frame);
                self.process(ev).await?;
            },
            res = self.port.read(&mut buf), if reading => {
                let n = res?;
                if n == 0 {
                    // Let the parser drain, then frame_rx reports it.
                    debug!("EOF on port");
                    self.kiss_tx = None;
                } else if let Some(tx) = &self.kiss_tx {
                    debug!("Read {n} bytes from port");
                    tx.send(buf[..n].to_vec()).await?;
                }
            },
        }
        Ok(())
    }

    async fn actions(&mut self, event: Event) -> Result<()> {
        let ev = self.link.event(event);
        self.process(ev).await
    }

    async fn process(&mut self, events: Vec<ReturnEvent>) -> Result<()> {
        for ev in events {
            match &ev {
                ReturnEvent::Indication(i) => {
                    info!("{i:?}");
                    match i {
                        Indication::ConnectConfirmation(c) if *c != Cause::Ok => {
                            self.refused = Some(*c);
                        }
                        Indication::DisconnectIndication(_)
                        | Indication::DisconnectConfirmation(_) => self.eof = true,
                        _ => {}
                    }
                }
                ReturnEvent::Data(Delivery::Raw { payload, .. }) => {
                    self.incoming.extend(payload);
                }
                ReturnEvent::Data(d) => debug!("Not for us: {d:?}"),
                ReturnEvent::Frame(..) => {}
            }
            if let Some(bytes) = self.link.encode(&ev)? {
                if let Some(c) = &mut self.capture {
                    c.write(&bytes, Direction::Sent)?;
                }
                self.port.write_all(&kiss::escape(&bytes, 0)).await?;
                self.port.flush().await?;
            }
        }
        Ok(())
    }

    fn flush_capture(&mut self) -> Result<()> {
        if let Some(c) = &mut self.capture {
            c.flush()?;
        }
        Ok(())
    }
}

impl<P> Drop for Client<P> {
    fn drop(&mut self) {
        if !self.link.is_disconnected() {
            warn!("Dropping connection in state {:?}", self.link.state());
        }
    }
}
