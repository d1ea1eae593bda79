#[cfg(not(windows))]
mod fuzz {
    use std::io::{self, Cursor};

    use honggfuzz::fuzz;
    use otapply::format::bspatch;

    pub fn main() {
        let old = (0..4096u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();

        loop {
            fuzz!(|data: &[u8]| {
                let _ = bspatch::apply(Cursor::new(&old), old.len() as u64, data, io::sink());
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
