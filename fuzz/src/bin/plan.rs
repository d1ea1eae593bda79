#[cfg(not(windows))]
mod fuzz {
    use honggfuzz::fuzz;
    use otapply::format::plan::Plan;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                if let Ok(s) = std::str::from_utf8(data) {
                    if let Ok(plan) = toml_edit::de::from_str::<Plan>(s) {
                        for p in &plan.partitions {
                            for op in &p.operations {
                                let _ = op.validate(plan.block_size);
                            }
                        }
                    }
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
