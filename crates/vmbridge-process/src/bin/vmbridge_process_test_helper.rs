use std::{
    env,
    io::{self, Read, Write},
    process, thread,
    time::Duration,
};

fn required(value: Option<String>, flag: &str) -> String {
    value.unwrap_or_else(|| {
        eprintln!("missing value for {flag}");
        process::exit(2);
    })
}

fn parse_num<T: std::str::FromStr>(value: Option<String>, flag: &str) -> T {
    let value = required(value, flag);
    value.parse().unwrap_or_else(|_| {
        eprintln!("invalid number for {flag}: {value}");
        process::exit(2);
    })
}

fn write_repeated(mut writer: impl Write, mut bytes: usize, fill: u8) -> io::Result<()> {
    let buf = [fill; 8 * 1024];
    while bytes > 0 {
        let n = bytes.min(buf.len());
        writer.write_all(&buf[..n])?;
        bytes -= n;
    }
    writer.flush()
}

fn spawn_child_sleep(ms: u64) {
    let exe = env::current_exe().unwrap_or_else(|err| {
        eprintln!("failed to resolve current exe: {err}");
        process::exit(2);
    });

    let _child = process::Command::new(exe)
        .args(["--sleep-ms", &ms.to_string()])
        .spawn()
        .unwrap_or_else(|err| {
            eprintln!("failed to spawn child: {err}");
            process::exit(2);
        });
}

fn main() {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--stdout" => {
                let text = required(args.next(), "--stdout");
                println!("{text}");
            }
            "--stderr" => {
                let text = required(args.next(), "--stderr");
                eprintln!("{text}");
            }
            "--stderr-bytes" => {
                let bytes = parse_num(args.next(), "--stderr-bytes");
                write_repeated(io::stderr().lock(), bytes, b'b').unwrap();
            }
            "--echo-stdin" => {
                let mut input = Vec::new();
                io::stdin().read_to_end(&mut input).unwrap();
                io::stdout().write_all(&input).unwrap();
                io::stdout().flush().unwrap();
            }
            "--sleep-ms" => {
                let ms = parse_num(args.next(), "--sleep-ms");
                thread::sleep(Duration::from_millis(ms));
            }
            "--spawn-child-sleep-ms" => {
                let ms = parse_num(args.next(), "--spawn-child-sleep-ms");
                spawn_child_sleep(ms);
            }
            "--exit" => {
                let code = parse_num(args.next(), "--exit");
                process::exit(code);
            }
            other => {
                eprintln!("unknown argument: {other}");
                process::exit(2);
            }
        }
    }
}
