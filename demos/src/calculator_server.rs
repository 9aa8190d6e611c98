// Serves the calculator contract.
//
//   RUST_LOG=debug cargo run --bin calculator-server -- 127.0.0.1:7000

use std::net::SocketAddr;
use std::sync::Arc;

use rawrpc::{Config, ConnectionInfo, Observer, Response, Server, Status};

#[allow(dead_code)]
mod calculator;
use calculator::{Calculator, CalculatorServer};

struct Calc;

impl Calculator for Calc {
    fn add(&self, a: i64, b: i64) -> Response<i64> {
        Ok(a.wrapping_add(b))
    }

    fn sub(&self, a: i64, b: i64) -> Response<i64> {
        Ok(a.wrapping_sub(b))
    }

    fn mul(&self, a: i64, b: i64) -> Response<i64> {
        a.checked_mul(b)
            .ok_or_else(|| Status::invalid_argument("overflow"))
    }

    fn div(&self, a: i64, b: i64) -> Response<i64> {
        a.checked_div(b)
            .ok_or_else(|| Status::invalid_argument("division by zero"))
    }

    fn sum(&self, xs: Vec<i64>) -> Response<i64> {
        Ok(xs.into_iter().fold(0, i64::wrapping_add))
    }

    fn greet(&self, name: String) -> Response<String> {
        Ok(format!("Hello {name}!"))
    }
}

// log connection lifecycle
struct Tracer;

impl Observer for Tracer {
    fn server_started(&self, addr: SocketAddr) {
        log::info!("calculator listening on {addr}");
    }

    fn connection_created(&self, info: &ConnectionInfo) {
        log::info!("+ connection {} from {}", info.id, info.peer);
    }

    fn connection_closed(&self, info: &ConnectionInfo) {
        log::info!("- connection {} from {}", info.id, info.peer);
    }

    fn connection_aborted(&self, info: &ConnectionInfo) {
        log::warn!("! connection {} from {} aborted", info.id, info.peer);
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| String::from("127.0.0.1:7000"));

    Server::new(Config::new())
        .add_service(CalculatorServer::new(Calc))
        .observe(Arc::new(Tracer))
        .serve(addr.as_str())?;
    Ok(())
}
