macro_rules! id_newtype {
    ($name:ident, $inner:ty, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub $inner);

        impl From<$inner> for $name {
            fn from(val: $inner) -> Self {
                $name(val)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(
    NodeId,
    u16,
    "Logical identifier of a daemon, assigned in the configuration file. \
     Valid ids are 1..=node_count; 0 is never a node."
);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_valid(self, node_count: u16) -> bool {
        self.0 >= 1 && self.0 <= node_count
    }
}

id_newtype!(
    InterfaceId,
    u32,
    "Identifier of one network interface of a node; a leg is an ordered pair of these."
);

id_newtype!(
    LinkSeq,
    u64,
    "Per-link packet sequence number. 0 marks a standalone ack with no data."
);

impl LinkSeq {
    pub fn next(self) -> Self {
        LinkSeq(self.0 + 1)
    }
}

id_newtype!(
    FlowSeq,
    u64,
    "Per-(source, destination) reliable flow sequence number, starting at 1."
);

id_newtype!(
    Epoch,
    u32,
    "Incarnation / source epoch: wall-clock seconds at process start. An \
     increase signals a crash-restart."
);
