use anyhow::Result;
use clap::Parser;

use hdlcarq::r#async::ConnectionBuilder;
use hdlcarq::Addr;

#[derive(Parser, Debug)]
struct Opt {
    #[clap(short = 'p', default_value = "/dev/null")]
    port: String,

    #[clap(short = 's')]
    src: String,

    #[clap(short = 'e')]
    ext: bool,

    #[clap(short = 'v', default_value = "0")]
    v: usize,

    #[clap(long)]
    capture: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module("hdlcarq")
        .verbosity(opt.v)
        .init()?;
    println!("Awaiting connection");
    let mut client = {
        let mut builder =
            ConnectionBuilder::serial(Addr::new(&opt.src)?, &opt.port, 9600)?.extended(opt.ext);
        if let Some(capture) = opt.capture {
            builder = builder.capture(capture);
        }
        builder.accept().await?
    };
    println!("Connected to {:?}", client.peer());
    client.write(b"Welcome to the server!\r").await?;
    loop {
        let data = client.read().await?;
        if data.is_empty() {
            eprintln!("Got EOF");
            break;
        }
        let s = String::from_utf8_lossy(&data);
        let s = s.trim_end();
        client.write(format!("Got <{s}>\r").as_bytes()).await?;
    }
    eprintln!("End of main loop");
    client.disconnect().await?;
    Ok(())
}
