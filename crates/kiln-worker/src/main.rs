//! Benchmark worker entry point.
//!
//! Spawned by the pool with a pipe on each of stdin/stdout; serves framed
//! timing jobs until the shutdown sentinel arrives or the parent closes the
//! pipe. Everything interesting lives in `kiln::autotune::worker`.

use std::io;

use kiln_backend_ref_cpu::BenchHandler;

fn main() -> io::Result<()> {
    let handler = BenchHandler::new();
    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    kiln::autotune::worker::serve(stdin, stdout, &handler)
}
