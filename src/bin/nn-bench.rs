//! Benchmarks model loading, compilation and warm inference.

use std::process;
use std::time::Instant;

use compiled_nn::codegen::{CompilationSettings, CompiledNN};
use compiled_nn::Model;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!(
            "Usage: {} <path to model> <number of iterations>",
            args.first().map(String::as_str).unwrap_or("nn-bench")
        );
        process::exit(1);
    }
    let iterations: u32 = args[2].parse().unwrap_or_else(|_| {
        eprintln!("Invalid iteration count: {}", args[2]);
        process::exit(1);
    });

    let start = Instant::now();
    let model = Model::load(&args[1]).unwrap_or_else(|err| {
        eprintln!("Error loading model: {err}");
        process::exit(1);
    });
    let mut nn =
        CompiledNN::compile(&model, &CompilationSettings::default()).unwrap_or_else(|err| {
            eprintln!("Error compiling: {err}");
            process::exit(1);
        });
    println!(
        "Loading and compilation time: {}ns ({} bytes of code)",
        start.elapsed().as_nanos(),
        nn.code_size()
    );

    // Warm up caches and the branch predictor.
    for _ in 0..6 {
        nn.apply();
    }

    let start = Instant::now();
    for _ in 0..iterations {
        nn.apply();
    }
    println!(
        "Average execution time over {} runs: {}ns",
        iterations,
        start.elapsed().as_nanos() / u128::from(iterations.max(1))
    );
}
