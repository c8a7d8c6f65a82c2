//! Error types for the controller and worker binaries.
//!
//! Follows the teacher's `error_chain!`-based scheme: one `Error`/`ErrorKind`
//! pair per crate, `foreign_links` for the I/O and serialization crates we
//! round-trip through, and `?`-propagation everywhere instead of panics.
//! Session and scheduler threads catch at their own boundary and log; a
//! single bad connection never brings down the controller.

#![allow(deprecated)]

error_chain::error_chain! {
    foreign_links {
        Io(std::io::Error);
        Yaml(serde_yaml::Error);
        Json(serde_json::Error);
        Bincode(bincode::Error);
        Framing(splash_proto::FramingError);
    }

    errors {
        /// Handshake failed: bad magic, mismatched protocol version, or
        /// malformed hello. The session thread drops the connection.
        BadHandshake(detail: String) {
            description("handshake failed")
            display("handshake failed: {}", detail)
        }

        /// A `build.yml` document did not parse, or a target within it was
        /// malformed. Other targets in the same script may still load.
        ScriptError(path: String, detail: String) {
            description("build script error")
            display("{}: {}", path, detail)
        }

        /// No toolchain is available for a required (name, arch) pair, or
        /// a required library could not be resolved. The individual node
        /// is marked invalid; it does not abort the whole build.
        Resolution(detail: String) {
            description("resolution error")
            display("{}", detail)
        }

        /// The on-disk cache entry's stored hash did not match its data.
        CacheIntegrity(oid: String) {
            description("cache integrity check failed")
            display("cache entry {} failed integrity check and was evicted", oid)
        }

        /// Requested an oid that the cache has never heard of.
        NotCached(oid: String) {
            description("object not in cache")
            display("object {} is not in the cache", oid)
        }
    }
}
