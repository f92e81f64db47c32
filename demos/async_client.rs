use std::io::Write;

use anyhow::Result;
use clap::Parser;
use tokio::io::AsyncReadExt;

use hdlcarq::r#async::ConnectionBuilder;
use hdlcarq::Addr;

#[derive(Parser, Debug)]
struct Opt {
    #[clap(short = 'p', default_value = "/dev/null")]
    port: String,

    #[clap(short = 's')]
    src: String,

    #[clap(short = 'r')]
    cr: bool,

    #[clap(short = 'e')]
    ext: bool,

    #[clap(short = 'v', default_value = "0")]
    v: usize,

    #[clap(long)]
    capture: Option<std::path::PathBuf>,

    #[clap()]
    dst: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module("hdlcarq")
        .verbosity(opt.v)
        .init()?;
    let mut stdin = tokio::io::stdin();
    let mut client = {
        let mut builder =
            ConnectionBuilder::serial(Addr::new(&opt.src)?, &opt.port, 9600)?.extended(opt.ext);
        if let Some(capture) = opt.capture {
            builder = builder.capture(capture);
        }
        builder.connect(Addr::new(&opt.dst)?).await?
    };
    println!("Connected");
    let mut sigint = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::interrupt())?
    };
    loop {
        let mut buf = [0; 1024];
        tokio::select! {
            _ = sigint.recv() => {
                eprintln!("Sigint received");
                break;
            },
            res = stdin.read(&mut buf) => {
                let res = res?;
                if res == 0 {
                    eprintln!("Got EOF from stdin");
                    break;
                }
                let buf = &buf[..res];
                if buf == b"exit\n" {
                    eprintln!("Got 'exit' from user");
                    break;
                }
                let buf: Vec<_> = if opt.cr {
                    buf.iter().map(|&b| if b == b'\n' { b'\r' } else { b }).collect()
                } else {
                    buf.to_vec()
                };
                client.write(&buf).await?;
            },
            data = client.read() => {
                let data = data?;
                if data.is_empty() {
                    eprintln!("Got EOF");
                    break;
                }
                let s = String::from_utf8_lossy(&data);
                let s = if opt.cr { s.replace('\r', "\n") } else { s.into_owned() };
                print!("{s}");
                std::io::stdout().flush()?;
            },
        }
    }
    eprintln!("End of main loop");
    client.disconnect().await?;
    eprintln!("Disconnected");
    Ok(())
}
