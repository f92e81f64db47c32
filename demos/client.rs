use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use hdlcarq::{Addr, Client, Config, Kiss};

#[derive(Parser, Debug)]
struct Opt {
    #[clap(short = 'p', default_value = "/dev/null")]
    port: String,

    #[clap(short = 's', default_value = "M0THC-1")]
    src: String,

    /// Send CR line endings.
    #[clap(short = 'r')]
    cr: bool,

    /// Ask for modulus 128.
    #[clap(short = 'e')]
    ext: bool,

    #[clap(short = 'v', default_value = "0")]
    v: usize,

    #[clap()]
    dst: String,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    let done = Arc::new(AtomicBool::new(false));
    // Set whenever there's something other than radio to look at.
    let wake = Arc::new(AtomicBool::new(false));
    stderrlog::new()
        .module("hdlcarq")
        .verbosity(opt.v)
        .init()?;
    let k = Kiss::new(&opt.port)?;
    let config = Config::ax25().extended(opt.ext);
    let mut c = Client::with_config(config, Addr::new(&opt.src)?, Box::new(k));

    let d = done.clone();
    let w = wake.clone();
    ctrlc::set_handler(move || {
        eprintln!("Received SIGINT signal, shutting down...");
        d.store(true, Ordering::SeqCst);
        w.store(true, Ordering::SeqCst);
    })?;

    let (tx, rx) = std::sync::mpsc::channel();
    let cr = opt.cr;
    let w = wake.clone();
    std::thread::spawn(move || {
        use std::io::BufRead;
        for line in std::io::stdin().lock().lines() {
            let line = line.map(|s| s.trim_end().to_owned() + if cr { "\r" } else { "\n" });
            if tx.send(line).is_err() {
                break;
            }
            w.store(true, Ordering::SeqCst);
        }
    });

    eprintln!("==== CONNECTING");
    c.connect(&Addr::new(&opt.dst)?, opt.ext)?;
    eprintln!("==== CONNECTED");
    while !done.load(Ordering::SeqCst) {
        match c.read_until(wake.clone())? {
            Some(data) => {
                print!("{}", String::from_utf8_lossy(&data));
                std::io::stdout().flush()?;
            }
            None if c.eof() => {
                eprintln!("==== REMOTE DISCONNECTED");
                break;
            }
            None => {}
        }
        wake.store(false, Ordering::SeqCst);
        while let Ok(line) = rx.try_recv() {
            match line {
                Ok(line) => c.write(line.as_bytes())?,
                Err(e) => eprintln!("Error reading line: {e}"),
            }
        }
    }
    c.disconnect()?;
    Ok(())
}
