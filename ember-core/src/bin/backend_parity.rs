use anyhow::{bail, Context};
use clap::Parser;
use ember_core::{BackendSet, ConvParams, ConvolutionOperator, NeedsGrad, Shape, Tensor};
use env_logger::Env;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Instant;

/// Run one convolution forward and backward on the accelerated and the
/// im2col backends and report how far apart they are.
#[derive(Parser, Debug)]
#[command(name = "backend_parity", version)]
struct Cli {
    #[arg(long, default_value_t = 2)]
    batch: usize,

    /// Input channels
    #[arg(long, default_value_t = 3)]
    channels: usize,

    #[arg(long, default_value_t = 16)]
    height: usize,

    #[arg(long, default_value_t = 16)]
    width: usize,

    #[arg(long, default_value_t = 8)]
    out_channels: usize,

    /// Square kernel size
    #[arg(long, default_value_t = 3)]
    kernel: usize,

    #[arg(long, default_value_t = 1)]
    stride: usize,

    #[arg(long, default_value_t = 1)]
    padding: usize,

    /// Fail when any deviation exceeds this
    #[arg(long, default_value_t = 1e-3)]
    tolerance: f32,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

struct Run {
    output: Tensor,
    grad_input: Tensor,
    grad_weight: Tensor,
    grad_bias: Tensor,
    millis: f64,
}

fn run(
    backends: BackendSet,
    params: ConvParams,
    x: &Tensor,
    w: &Tensor,
    b: &Tensor,
    go: &Tensor,
) -> anyhow::Result<Run> {
    let start = Instant::now();
    let (specialized, fallback) = (backends.specialized.name(), backends.fallback.name());
    let mut op = ConvolutionOperator::with_backends(params, backends);
    let output = op.forward(x, w, Some(b))?;
    let grads = op.backward(go, NeedsGrad::all())?;
    let millis = start.elapsed().as_secs_f64() * 1000.0;
    log::info!(
        "{:?} route ({} / {}) ran forward+backward in {:.2} ms",
        op.backend_kind(),
        specialized,
        fallback,
        millis
    );

    let grad_bias = grads
        .grad_bias
        .context("bias slot missing")?
        .into_result()?
        .context("bias gradient not computed")?;
    Ok(Run {
        output,
        grad_input: grads.grad_input.into_result()?.context("input gradient not computed")?,
        grad_weight: grads.grad_weight.into_result()?.context("weight gradient not computed")?,
        grad_bias,
        millis,
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let params = ConvParams::new((cli.stride, cli.stride), (cli.padding, cli.padding), 1)?;
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let x_shape = Shape::from([cli.batch, cli.channels, cli.height, cli.width]);
    let w_shape = Shape::from([cli.out_channels, cli.channels, cli.kernel, cli.kernel]);
    let x = Tensor::randn(x_shape, 0.0, 1.0, &mut rng)?;
    let w = Tensor::randn(w_shape, 0.0, 0.2, &mut rng)?;
    let b = Tensor::randn(Shape::from([cli.out_channels]), 0.0, 0.1, &mut rng)?;
    let (n, c, h, wd) =
        ember_core::output_size(x.shape(), w.shape(), params.stride, params.padding)?;
    let go = Tensor::randn(Shape::from([n, c, h, wd]), 0.0, 1.0, &mut rng)?;

    println!(
        "EMBER backend parity: input {} weight {} -> output {}",
        x.shape(),
        w.shape(),
        go.shape()
    );

    let fast = run(BackendSet::reference_with_accelerated(true), params, &x, &w, &b, &go)?;
    let slow = run(BackendSet::fallback_only(), params, &x, &w, &b, &go)?;

    let rows = [
        ("output", fast.output.max_abs_diff(&slow.output)?),
        ("grad_input", fast.grad_input.max_abs_diff(&slow.grad_input)?),
        ("grad_weight", fast.grad_weight.max_abs_diff(&slow.grad_weight)?),
        ("grad_bias", fast.grad_bias.max_abs_diff(&slow.grad_bias)?),
    ];
    for (what, diff) in rows {
        println!("  {:<12} max |diff| = {:.3e}", what, diff);
    }
    println!("  time: accelerated {:.2} ms, im2col {:.2} ms", fast.millis, slow.millis);

    if let Some((what, diff)) = rows.iter().find(|(_, d)| *d > cli.tolerance) {
        bail!("{} deviates by {} (tolerance {})", what, diff, cli.tolerance);
    }
    Ok(())
}
