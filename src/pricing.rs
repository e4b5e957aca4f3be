//! Fallback cost calculation for records without an explicit cost field

/// USD per million tokens for one model family.
#[derive(Debug, Clone, Copy)]
struct Rates {
    input: f64,
    output: f64,
    cache_creation: f64,
    cache_read: f64,
}

const OPUS: Rates = Rates {
    input: 15.0,
    output: 75.0,
    cache_creation: 18.75,
    cache_read: 1.5,
};

const SONNET: Rates = Rates {
    input: 3.0,
    output: 15.0,
    cache_creation: 3.75,
    cache_read: 0.3,
};

const HAIKU: Rates = Rates {
    input: 0.25,
    output: 1.25,
    cache_creation: 0.3,
    cache_read: 0.03,
};

fn rates_for(model: &str) -> Rates {
    let model = model.to_lowercase();
    if model.contains("opus") {
        OPUS
    } else if model.contains("haiku") {
        HAIKU
    } else {
        // Sonnet pricing doubles as the default for unknown models.
        SONNET
    }
}

/// Compute the USD cost of one request from its token counts.
///
/// Used only when a raw record carries no `costUSD` field. Rounded to
/// six decimal places.
pub fn calculate_cost(
    model: &str,
    input_tokens: u64,
    output_tokens: u64,
    cache_creation_tokens: u64,
    cache_read_tokens: u64,
) -> f64 {
    let rates = rates_for(model);
    let per_million = |tokens: u64, rate: f64| tokens as f64 / 1_000_000.0 * rate;

    let cost = per_million(input_tokens, rates.input)
        + per_million(output_tokens, rates.output)
        + per_million(cache_creation_tokens, rates.cache_creation)
        + per_million(cache_read_tokens, rates.cache_read);

    (cost * 1_000_000.0).round() / 1_000_000.0
}
