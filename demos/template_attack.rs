use anyhow::{Context, Result};
use ndarray::{Array1, Array2};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::{Rng, SeedableRng, rngs::StdRng};
use ndarray_rand::rand_distr::Normal;
use scatemplate::modeling::LdaClassifier;
use std::iter::zip;

const NUM_CLASSES: usize = 16;
const NUM_SAMPLES: usize = 20;
const DIM: usize = 3;

/// Simulate traces leaking the bits of a 4-bit intermediate value, with a different weight on
/// each sample.
fn simulate(rng: &mut StdRng, values: &Array1<u16>, noise: f64) -> Array2<i16> {
    let noise = Array2::random_using(
        (values.len(), NUM_SAMPLES),
        Normal::new(0., noise).unwrap(),
        rng,
    );

    Array2::from_shape_fn((values.len(), NUM_SAMPLES), |(i, j)| {
        let bit = (values[i] >> (j % 4)) & 1;
        let weight = 10.0 + 3.0 * j as f64;
        (weight * bit as f64 + noise[[i, j]]).round() as i16
    })
}

fn main() -> Result<()> {
    // Seed rng to get the same output each run
    let mut rng = StdRng::seed_from_u64(0);

    // Profiling: the device leaks x = plaintext ^ key with a known key
    let profiling_values = Array1::from_shape_fn(20_000, |_| rng.gen_range(0..NUM_CLASSES as u16));
    let profiling_traces = simulate(&mut rng, &profiling_values, 8.0);

    let mut lda = LdaClassifier::new(NUM_CLASSES, DIM, NUM_SAMPLES)?;
    lda.fit(profiling_traces.view(), profiling_values.view())
        .context("Failed to fit the templates")?;

    // Attack: the key is unknown, plaintexts are known
    let key: u16 = 0xb;
    let plaintexts = Array1::from_shape_fn(50, |_| rng.gen_range(0..NUM_CLASSES as u16));
    let attack_traces = simulate(&mut rng, &plaintexts.mapv(|p| p ^ key), 8.0);

    let log_proba = lda.predict_log_proba(attack_traces.view())?;
    let predicted = lda.predict(attack_traces.view())?;
    let accuracy = zip(predicted.iter(), plaintexts.iter())
        .filter(|&(&x, &p)| x == p ^ key)
        .count() as f64
        / plaintexts.len() as f64;
    println!("Single trace accuracy: {accuracy:.3}");

    // Combine the traces with the maximum likelihood rule for each key guess
    let scores: Array1<f64> = (0..NUM_CLASSES as u16)
        .map(|guess| {
            zip(log_proba.rows(), plaintexts.iter())
                .map(|(row, &p)| row[(p ^ guess) as usize])
                .sum()
        })
        .collect();
    let best_guess = scores
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(guess, _)| guess)
        .context("No key guess")?;
    println!("Best subkey guess: {best_guess:#x} (expected {key:#x})");

    Ok(())
}
