// The contract both binaries are built from. The server implements the
// trait; the client calls through the proxy. Ordinals come from the method
// list below, so both ends agree without exchanging names.

rawrpc::service! {
    pub trait Calculator {
        fn add(&self, a: i64, b: i64) -> i64;
        fn sub(&self, a: i64, b: i64) -> i64;
        fn mul(&self, a: i64, b: i64) -> i64;
        /// Fails with `InvalidArgument` on a zero divisor.
        fn div(&self, a: i64, b: i64) -> i64;
        fn sum(&self, xs: Vec<i64>) -> i64;
        fn greet(&self, name: String) -> String;
    }
    server CalculatorServer;
    proxy CalculatorProxy;
}
