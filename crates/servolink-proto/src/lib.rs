mod client;
mod codec;
mod error;
mod frame;
mod message;
mod npy;
mod server;
mod value;

pub use client::{ClientOptions, RpcClient};
pub use codec::{decode_value, encode_value, DEFAULT_MAX_FRAME_BYTES};
pub use error::{ProtoError, RpcError};
pub use frame::{read_frame_async, write_frame_async, MAGIC};
pub use message::{
    ensure_action, ensure_observation, now_timestamp_ns, Action, Observation,
    Status,
};
pub use npy::{decode_npy, encode_npy};
pub use server::{EndpointHandler, RpcServer};
pub use value::{Dtype, ModalityConfig, NdArray, Value, ValueMap};
