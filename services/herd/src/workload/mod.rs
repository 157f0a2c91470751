//! Demonstration workloads
//!
//! The grouped child runs [`main`], which picks a workload by the name in
//! `argv[1]` and hands it the remaining arguments. Workloads only touch the
//! group through [`Context`].

mod ping;

use anyhow::Result;

use crate::daemon::Context;

/// A runnable workload: context and arguments in, exit code out
pub type Workload = fn(&Context<'_>, &[String]) -> Result<i32>;

/// Exit code for a workload name nobody knows
pub const UNKNOWN_WORKLOAD: i32 = 2;

const WORKLOADS: &[(&str, Workload)] = &[("hello", hello), ("ping", ping::run)];

pub fn lookup(name: &str) -> Option<Workload> {
    WORKLOADS
        .iter()
        .find(|(known, _)| *known == name)
        .map(|&(_, workload)| workload)
}

pub fn names() -> impl Iterator<Item = &'static str> {
    WORKLOADS.iter().map(|&(name, _)| name)
}

/// Entry point of the `herd` daemon's grouped child
pub fn main(context: &Context<'_>, argv: &[String]) -> i32 {
    let Some(name) = argv.get(1) else {
        eprintln!(
            "no workload given; available: {}",
            names().collect::<Vec<_>>().join(", ")
        );
        return UNKNOWN_WORKLOAD;
    };
    let Some(workload) = lookup(name) else {
        eprintln!(
            "unknown workload '{}'; available: {}",
            name,
            names().collect::<Vec<_>>().join(", ")
        );
        return UNKNOWN_WORKLOAD;
    };

    match workload(context, &argv[2..]) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} failed on rank {}: {:#}", name, context.rank(), e);
            1
        }
    }
}

/// Greets from every rank
fn hello(context: &Context<'_>, args: &[String]) -> Result<i32> {
    println!(
        "hello from {}/{}: {}",
        context.rank(),
        context.world_size(),
        args.join(" ")
    );
    Ok(0)
}
