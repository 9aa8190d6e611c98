// Calls the calculator server a few times.
//
//   cargo run --bin calculator-client -- 127.0.0.1:7000

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rawrpc::{Client, ClientConfig, Error};

#[allow(dead_code)]
mod calculator;
use calculator::CalculatorProxy;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| String::from("127.0.0.1:7000"));

    let config = ClientConfig::default().read_timeout(Some(Duration::from_secs(5)));
    let client = Client::connect_with(addr.as_str(), config)
        .with_context(|| format!("connect to {addr}"))?;
    let calc = CalculatorProxy::new(Arc::new(client));

    println!("3 + 4 = {}", calc.add(3, 4)?);
    println!("3 - 4 = {}", calc.sub(3, 4)?);
    println!("6 * 7 = {}", calc.mul(6, 7)?);
    println!("sum(1..=10) = {}", calc.sum((1..=10).collect())?);
    println!("{}", calc.greet(String::from("rawrpc"))?);

    match calc.div(1, 0) {
        Err(Error::Remote(status)) => println!("1 / 0 failed: {status}"),
        other => anyhow::bail!("expected a remote error, got {other:?}"),
    }
    Ok(())
}
