//! VIGS guest/host wire ABI.
//!
//! Everything here is plain data: layouts, command ids and little-endian decoders for the
//! batches a guest driver writes into shared RAM. Execution lives in `vigs-server`.
#![forbid(unsafe_code)]

pub mod vigs {
    pub mod cmd_writer;
    pub mod vigs_cmd;
}
