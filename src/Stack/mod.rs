pub mod StdStack;

pub use StdStack::{
    Stack, StackBuilder, StackStatus, STACK_MAX_COUNT, STACK_MZ_PREFIX, STACK_NAMESIZE,
};
