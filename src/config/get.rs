use anyhow::Result;
use std::process;

use crate::args::BaseArgs;

pub fn run(base: BaseArgs, key: &str, global: bool, local: bool) -> Result<()> {
    let cfg = super::load_scoped(global, local)?;

    let Some(value) = cfg.get_field(key) else {
        // unset keys print nothing, like `git config --get`
        process::exit(1);
    };
    if base.json {
        println!("{}", serde_json::to_string(value)?);
    } else {
        println!("{value}");
    }
    Ok(())
}
