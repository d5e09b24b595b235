pub(crate) mod audit;
pub(crate) mod seed;

use jitgate_engine::crypto;

use crate::OutputFormat;

pub(crate) fn cmd_hash_answer(answer: &str, output: OutputFormat) {
    let digest = crypto::hash_answer(answer);
    match output {
        OutputFormat::Text => println!("{}", digest),
        OutputFormat::Json => println!("{}", serde_json::json!({ "digest": digest })),
    }
}
