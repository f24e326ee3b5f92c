#![allow(clippy::too_many_arguments)]
extern crate num;
#[macro_use]
extern crate num_derive;
mod binary_reader;
mod binary_writer;
mod cabac_contexts;
#[macro_use]
mod common;
mod bins;
mod bool_coder;
mod cabac;
mod context_table;
mod mb_coder;
mod neighbor_cache;
mod residual;
mod slice_header;
use binary_reader::BinaryReader;
use binary_writer::BinaryWriter;
use bins::Bins;
use clap::Parser;
use colored::*;
use debug_print::*;
use mb_coder::*;
use rand::{prelude::StdRng, SeedableRng};
use rayon::prelude::*;
use slice_header::*;
use std::collections::HashMap;
use std::io::{self, Write};
use std::process;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to output bitstream ("-" for stdout)
    #[clap(short, long)]
    output: String,
    /// Picture size in macroblocks (WIDTHxHEIGHT)
    #[clap(long)]
    mb_size: String,
    /// Slice type (I, P, B, SP, SI or a slice_type value 0..=9)
    #[clap(long, default_value = "I")]
    slice_type: String,
    /// Slice QP
    #[clap(long, default_value_t = 26)]
    qp: isize,
    /// cabac_init_idc for P, SP and B slices
    #[clap(long, default_value_t = 0)]
    cabac_init_idc: usize,
    /// Number of slices per picture
    #[clap(long, default_value_t = 1)]
    num_slices: usize,
    /// Active reference indices (L0[,L1])
    #[clap(long, default_value = "1,1")]
    num_ref_idx: String,
    /// Enable 8x8 transforms
    #[clap(long)]
    transform_8x8: bool,
    /// Number of coding threads (0 = one per core)
    #[clap(long, default_value_t = 0)]
    threads: usize,
    /// Seed of the macroblock synthesizer
    #[clap(long, default_value_t = 0)]
    seed: u64,
    /// Extra parameters (PARAM1=VAL1[,PARAM2=VAL2,...])
    #[clap(long)]
    extra_params: Option<String>,
}

fn fail(msg: String) -> ! {
    eprintln!("{}: {}", "error".red(), msg);
    process::exit(1);
}

fn synthesize(slices: &[SliceParams], synth: &SynthParams, seed: u64) -> Vec<Vec<Macroblock>> {
    let mut rng: StdRng = SeedableRng::seed_from_u64(seed);
    slices
        .iter()
        .map(|slice| {
            (0..slice.num_mbs)
                .map(|_| random_macroblock(&mut rng, slice, synth))
                .collect()
        })
        .collect()
}

fn main() {
    let args = Args::parse();

    let mb_size = args
        .mb_size
        .split('x')
        .map(|x| x.parse::<usize>())
        .collect::<Vec<Result<usize, std::num::ParseIntError>>>();
    let (mb_width, mb_height) = if let [Ok(width), Ok(height)] = mb_size[..] {
        (width, height)
    } else {
        fail(format!("Invalid mb-size: {}", args.mb_size))
    };

    let slice_type = match SliceType::parse(&args.slice_type) {
        Some(t) => t,
        None => fail(format!("Invalid slice-type: {}", args.slice_type)),
    };

    let num_ref_idx = args
        .num_ref_idx
        .split(',')
        .map(|x| x.parse::<usize>())
        .collect::<Vec<Result<usize, std::num::ParseIntError>>>();
    let num_ref_idx_active = match num_ref_idx[..] {
        [Ok(l0)] => [l0, 1],
        [Ok(l0), Ok(l1)] => [l0, l1],
        _ => fail(format!("Invalid num-ref-idx: {}", args.num_ref_idx)),
    };

    let mut extra_params: HashMap<String, String> = hashmap![];
    if let Some(params) = &args.extra_params {
        for param in params.split(',') {
            if let [key, val] = param.split('=').collect::<Vec<&str>>()[..] {
                extra_params.insert(key.to_string(), val.to_string());
            } else {
                fail(format!("Invalid extra-params: {}", params));
            }
        }
    }
    let synth = match SynthParams::from_extra_params(&extra_params) {
        Ok(synth) => synth,
        Err(e) => fail(format!("Invalid extra-params: {}", e)),
    };

    let params = SliceParams {
        cabac_init_idc: args.cabac_init_idc,
        num_ref_idx_active,
        transform_8x8_mode: args.transform_8x8,
        ..SliceParams::new(slice_type, args.qp, mb_width, mb_height)
    };
    if !params.is_valid() || mb_height == 0 {
        fail(format!("Invalid slice parameters: {:?}", params));
    }
    let slices = params.split(args.num_slices);
    let picture = synthesize(&slices, &synth, args.seed);

    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads)
        .thread_name(|idx| format!("slice-{}", idx))
        .build()
    {
        Ok(pool) => pool,
        Err(e) => fail(format!("failed to create thread pool: {}", e)),
    };

    // one coding session per slice
    let payloads: Vec<Bins> = pool.install(|| {
        slices
            .par_iter()
            .zip(picture.par_iter())
            .map(|(slice, mbs)| encode_slice(slice, mbs))
            .collect()
    });

    let mut stream = vec![];
    {
        let mut writer = BinaryWriter::memory(&mut stream);
        for (i, bins) in payloads.iter().enumerate() {
            match writer.write_payload(bins) {
                Ok(_n) => {
                    debug_eprintln!("slice {}: {} bytes", i, _n);
                }
                Err(e) => fail(format!("failed to write slice {}: {}", i, e)),
            }
        }
    }
    {
        let stdout = io::stdout();
        let mut writer = if args.output == *"-" {
            BinaryWriter::standard(&stdout)
        } else {
            match BinaryWriter::file(&args.output) {
                Ok(f) => f,
                Err(e) => fail(format!("failed to open output file: {}", e)),
            }
        };
        if let Err(e) = writer.write_all(&stream).and_then(|_| writer.flush()) {
            fail(format!("failed to write output: {}", e));
        }
    }

    let mut reader = if args.output == *"-" {
        BinaryReader::vec(&stream)
    } else {
        match BinaryReader::file(&args.output) {
            Ok(f) => f,
            Err(e) => fail(format!("failed to open output file for reading: {}", e)),
        }
    };
    let mut read_payloads = vec![];
    loop {
        match reader.read_payload() {
            Ok(Some(payload)) => read_payloads.push(payload),
            Ok(None) => break,
            Err(e) => fail(format!("failed to read slice {}: {}", read_payloads.len(), e)),
        }
    }
    if read_payloads.len() != slices.len() {
        fail(format!(
            "expected {} slices, read {}",
            slices.len(),
            read_payloads.len()
        ));
    }

    let decoded: Vec<Vec<Macroblock>> = pool.install(|| {
        slices
            .par_iter()
            .zip(read_payloads.par_iter())
            .map(|(slice, payload)| decode_slice(slice, payload))
            .collect()
    });

    let expected = synthesize(&slices, &synth, args.seed);
    for ((slice, expected), decoded) in slices.iter().zip(expected.iter()).zip(decoded.iter()) {
        if decoded.len() != expected.len() {
            fail(format!(
                "slice at mb {}: decoded {} macroblocks, expected {}",
                slice.first_mb_addr,
                decoded.len(),
                expected.len()
            ));
        }
        if let Some(i) = (0..expected.len()).find(|&i| expected[i] != decoded[i]) {
            debug_eprintln!("expected {:?}", expected[i]);
            debug_eprintln!("decoded {:?}", decoded[i]);
            fail(format!("mismatch at mb {}", slice.first_mb_addr + i));
        }
    }
    eprintln!(
        "{}: {} slices, {} macroblocks, {} bytes",
        "verified".green(),
        slices.len(),
        params.num_mbs,
        stream.len()
    );
}
